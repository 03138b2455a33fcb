//! Bootstrap script injected into proxied HTML.
//!
//! Opens the control-channel WebSocket back to the proxy and streams
//! telemetry: uncaught errors, navigation timing, user interactions and
//! DOM mutations. Also services `execute` directives and displays
//! activity/toast broadcasts. The assembled tag is a pure function of
//! nothing and is cached after first use.

use std::sync::OnceLock;

/// Literal substring present in every instrumented page; tests and
/// double-injection checks key off this.
pub const SCRIPT_MARKER: &str = r#"data-pagescope="bootstrap""#;

const BOOTSTRAP_JS: &str = r#"
(function () {
  if (window.__pagescope) return;
  var scheme = location.protocol === 'https:' ? 'wss' : 'ws';
  var endpoint = scheme + '://' + location.host + '/__devtool_metrics';
  var ws = null;
  var queue = [];

  function send(type, data) {
    var msg = JSON.stringify({ type: type, data: data, url: location.href });
    if (ws && ws.readyState === WebSocket.OPEN) {
      ws.send(msg);
    } else {
      queue.push(msg);
      if (queue.length > 500) queue.shift();
    }
  }

  function connect() {
    ws = new WebSocket(endpoint);
    ws.onopen = function () {
      while (queue.length) ws.send(queue.shift());
    };
    ws.onclose = function () { setTimeout(connect, 2000); };
    ws.onmessage = function (event) {
      var msg;
      try { msg = JSON.parse(event.data); } catch (e) { return; }
      if (msg.type === 'execute') {
        var reply = { exec_id: msg.id };
        try {
          reply.result = eval(msg.code);
        } catch (e) {
          reply.error = String(e);
        }
        send('execution', reply);
      } else if (msg.type === 'toast' && msg.payload) {
        console.info('[pagescope]', msg.payload.title + ': ' + msg.payload.message);
      } else if (msg.type === 'activity' && msg.payload) {
        document.documentElement.dataset.pagescopeActive = String(msg.payload.active);
      }
    };
  }

  window.addEventListener('error', function (event) {
    send('error', {
      message: event.message,
      source: event.filename,
      line: event.lineno,
      column: event.colno,
      stack: event.error && event.error.stack
    });
  });

  window.addEventListener('unhandledrejection', function (event) {
    send('error', { message: 'Unhandled rejection: ' + String(event.reason) });
  });

  window.addEventListener('load', function () {
    var nav = performance.getEntriesByType('navigation')[0];
    if (nav) {
      send('performance', {
        dom_content_loaded_ms: nav.domContentLoadedEventEnd,
        load_ms: nav.loadEventEnd,
        title: document.title,
        raw: nav.toJSON()
      });
    }
  });

  var interactions = [];
  function flushInteractions() {
    if (interactions.length) {
      send('interactions', interactions.splice(0, interactions.length));
    }
  }
  ['click', 'input', 'submit'].forEach(function (kind) {
    document.addEventListener(kind, function (event) {
      var target = event.target || {};
      interactions.push({
        type: kind,
        selector: target.tagName ? target.tagName.toLowerCase() : null,
        x: event.clientX,
        y: event.clientY
      });
      if (interactions.length >= 10) flushInteractions();
    }, true);
  });
  setInterval(flushInteractions, 1000);

  var mutations = [];
  new MutationObserver(function (records) {
    records.forEach(function (record) {
      mutations.push({ type: record.type });
    });
    if (mutations.length >= 25) {
      send('mutations', mutations.splice(0, mutations.length));
    }
  }).observe(document.documentElement, { childList: true, subtree: true, attributes: true });
  setInterval(function () {
    if (mutations.length) send('mutations', mutations.splice(0, mutations.length));
  }, 1000);

  window.__pagescope = { send: send };
  connect();
})();
"#;

/// The full `<script>` tag to splice into HTML documents.
pub fn bootstrap_script() -> &'static str {
    static TAG: OnceLock<String> = OnceLock::new();
    TAG.get_or_init(|| format!("<script {SCRIPT_MARKER}>{BOOTSTRAP_JS}</script>"))
}
