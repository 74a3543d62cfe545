//! 命令行工具依赖的通用组件.

pub mod loader;

const SEP: &str = "--------------------------------------------------------";

/// 模型主目录的环境变量名.
pub const MODEL_HOME_ENV: &str = "SKELLYTOUR_HOME";

/// 用户主目录下默认的模型主目录名.
pub const MODEL_HOME_DIR: &str = ".skellytour";

/// 简单分隔线.
#[inline]
pub fn sep() -> &'static str {
    SEP
}

/// 获得可并行核心数.
pub fn cpus() -> usize {
    std::thread::available_parallelism().map_or_else(|_| num_cpus::get(), usize::from)
}

/// 获取 `{用户主目录}/.skellytour` 目录.
pub fn home_model_dir() -> Option<std::path::PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push(MODEL_HOME_DIR);
    Some(ans)
}
