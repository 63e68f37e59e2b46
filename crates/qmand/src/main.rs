//! Entry point for the qmand worker daemon.
//!
//! Connects to every configured queue server, then runs a worker until a
//! break condition or termination signal stops it.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Context;
use qman_lib::CommandSerializer;
use qman_lib::beanstalk::BeanstalkConnection;
use qmand::commands::register_builtin_commands;
use qmand::config::Config;
use qmand::event_loop::SharedConnection;
use qmand::logging;
use qmand::worker::{Worker, install_fatal_error_hook};
use tracing::info;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    logging::init(config.log_json());

    let mut connections: Vec<SharedConnection> = Vec::new();
    for server in config.servers() {
        let connection =
            BeanstalkConnection::connect_with_timeout(server.as_str(), config.io_timeout())
                .with_context(|| format!("failed to connect to {server}"))?;
        info!(server = %server, "Connected to queue server");
        connections.push(Rc::new(RefCell::new(connection)));
    }

    let mut serializer = CommandSerializer::new();
    register_builtin_commands(&mut serializer)?;

    let worker = Worker::builder()
        .with_config(config)
        .with_serializer(serializer)
        .build(connections)?;
    install_fatal_error_hook(worker.stop_handle());
    worker.run().await;
    Ok(())
}
