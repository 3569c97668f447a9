// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::flexi_logger::{
    Logger,
    LoggerHandle,
};
use ::std::sync::{
    Mutex,
    Once,
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

/// Keeps the logger alive for the lifetime of the process.
static LOGGER: Mutex<Option<LoggerHandle>> = Mutex::new(None);

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Initializes logging features. The log filter is taken from `RUST_LOG`, defaulting to warnings only.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        let handle: LoggerHandle = match Logger::try_with_env_or_str("warn").and_then(|logger| logger.start()) {
            Ok(handle) => handle,
            Err(e) => {
                eprintln!("initialize(): failed to start logger ({})", e);
                return;
            },
        };
        if let Ok(mut logger) = LOGGER.lock() {
            *logger = Some(handle);
        }
    });
}
