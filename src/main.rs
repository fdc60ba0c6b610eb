// Copyright 2026 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

#[macro_use]
extern crate log;

use ccache_storage_http::config::{self, Config};
use ccache_storage_http::{logger, Server};

use std::sync::Arc;

const USAGE: &str = "\
This is a ccache HTTP(S) storage helper, usually started automatically by
ccache when needed. More information here:
https://ccache.dev/storage-helpers.html
";

fn main() {
    // the helper is only useful when spawned by the cache client with its
    // environment prepared; a bare invocation gets the usage text
    if std::env::var_os(config::ENV_IPC_ENDPOINT).is_none()
        || std::env::var_os(config::ENV_URL).is_none()
    {
        eprint!("{}", USAGE);
        std::process::exit(1);
    }

    logger::init();

    // custom panic hook to terminate the whole process after unwinding
    std::panic::set_hook(Box::new(|info| {
        error!("{}", info);
        std::process::exit(101);
    }));

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to parse configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("starting");
    info!("IPC endpoint: {}", config.ipc_endpoint);
    info!("URL: {}", config.url);
    info!("idle timeout: {}", config.idle_timeout_seconds);

    let mut server = match Server::new(Arc::new(config)) {
        Ok(server) => server,
        Err(_) => {
            error!("failed to initialize IPC server");
            std::process::exit(1);
        }
    };

    server.run();
    info!("shutdown complete");
}
