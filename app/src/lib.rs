use std::sync::mpsc::channel;

use log::info;
use sip_engine::SipStack;
use thiserror::Error;

use crate::tasks::{
    console::ConsoleTask,
    sip::SipTask,
    task::{start_all, AppTask},
};
use crate::transport::UdpTransport;

mod messages;
mod settings;
mod tasks;
mod transport;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("task error: {0}")]
    Task(String),
}

pub fn run() -> Result<(), AppError> {
    info!("starting SIP agent");

    let settings = &settings::SETTINGS;
    let proxy = settings.proxy_addr()?;
    let transport = UdpTransport::bind(settings.sip_bind, proxy)
        .map_err(|err| AppError::Network(format!("bind {}: {err}", settings.sip_bind)))?;
    let local = transport
        .local_addr()
        .map_err(|err| AppError::Network(format!("{err:?}")))?;

    let config = settings.ua_config(local)?;
    info!("identity {} contact {}", config.uri, config.contact);
    let stack = SipStack::new(config, transport);

    let (sip_tx, sip_rx) = channel();

    let tasks: Vec<Box<dyn AppTask>> = vec![
        Box::new(SipTask::new(settings, sip_rx, stack)),
        Box::new(ConsoleTask::new(sip_tx)),
    ];

    // The console thread blocks on stdin; the agent ends with the SIP task.
    for (name, handle) in start_all(tasks)? {
        if name == "sip" {
            handle
                .join()
                .map_err(|_| AppError::Task("sip task panicked".into()))?;
            break;
        }
    }
    Ok(())
}
