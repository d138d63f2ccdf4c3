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
//! Operator factory trait definitions.
//!
//! Responsibilities:
//! - Defines the factory contract used to instantiate one operator per driver
//!   from shared plan-time configuration.
//! - A factory can be duplicated for a parallel pipeline; each duplicate
//!   closes independently.
//!
//! Key exported interfaces:
//! - Types: `OperatorFactory`.

use super::operator::Operator;

/// Factory contract for constructing runtime operators from plan-time
/// configuration.
pub trait OperatorFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Create one operator instance for the given driver. Fails once the
    /// factory has been closed.
    fn create(&self, dop: i32, driver_id: i32) -> Result<Box<dyn Operator>, String>;

    /// Mark the factory closed; subsequent `create` calls fail. Already
    /// created operators are unaffected.
    fn close(&self) {}

    /// New factory sharing this factory's configuration but with an
    /// independent closed flag.
    fn duplicate(&self) -> Box<dyn OperatorFactory>;
}
