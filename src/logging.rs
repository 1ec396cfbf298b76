//! tracing 日志初始化

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// 初始化全局 tracing subscriber
///
/// `RUST_LOG` 存在时优先使用，否则回退到配置中的 `log_level`。
/// 重复调用时静默忽略（测试中可能被多次调用）。
pub fn init_tracing(default_level: &str) {
    let fallback = default_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    let filter = EnvFilter::builder()
        .with_default_directive(fallback.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
