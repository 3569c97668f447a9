// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Constants
//======================================================================================================================

/// Maximum number of ports a process can drive.
pub const MAX_PORTS: usize = 32;

/// Default MTU of a port.
pub const DEFAULT_MTU: u16 = 1500;

/// Length of a receive batch in the demo and test tooling.
pub const RECEIVE_BATCH_SIZE: usize = 32;
