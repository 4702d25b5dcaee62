// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// Milliseconds since the Unix epoch.
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as u64
}

/// Polls `condition` up to `num_attempts` times, sleeping `interval` between
/// attempts, until it returns true. Returns whether the condition was met.
pub async fn await_condition<Fut, F>(
    interval: Duration,
    num_attempts: usize,
    condition: F,
) -> Result<bool>
where
    Fut: Future<Output = Result<bool>>,
    F: Fn() -> Fut,
{
    for _ in 0..num_attempts {
        if condition().await? {
            return Ok(true);
        }
        tokio::time::sleep(interval).await;
    }
    Ok(false)
}
