//! Domain models for the Pagescope proxy.

mod chaos;
mod config;
mod session;
mod traffic;

pub use chaos::{ChaosRule, ChaosRuleKind};
pub use config::ProxyConfig;
pub use session::{NavigationEntry, PageSession};
pub use traffic::{
    CustomLogData, DesignChatData, DesignRequestData, DesignStateData, ExecutionResult,
    FrontendErrorData, HttpExchange, InteractionData, MutationData, PanelMessageData,
    PerformanceData, ScreenshotData, SketchData, TrafficEntry, TrafficKind, TrafficPayload,
    TrafficStats,
};
