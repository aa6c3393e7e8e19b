// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

/// Virtual time as observed by the schedulers. The unit is scheduler
/// specific (lock-step epochs or discrete-event ticks); only ordering and
/// addition are ever relied upon.
pub type Time = u64;
