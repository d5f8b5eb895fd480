use std::io::Write;

/// 初始化日志, 默认info级别, 可通过环境变量 RUST_LOG 覆盖
pub fn log_init() {
    let env = env_logger::Env::default().default_filter_or("info");
    // 重复初始化(测试中)直接忽略
    let _ = env_logger::Builder::from_env(env)
        .target(env_logger::Target::Stderr)
        .format(|buf, record| writeln!(buf, "{}: {}", record.level(), record.args()))
        .try_init();
}
