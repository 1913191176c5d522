fn main() {
    let env = env_logger::Env::default()
        .filter_or("SIP_LOG_LEVEL", "debug")
        .write_style_or("SIP_LOG_STYLE", "always");

    env_logger::init_from_env(env);

    if let Err(err) = sip_agent::run() {
        log::error!("sip-agent error: {err}");
        std::process::exit(1);
    }
}
