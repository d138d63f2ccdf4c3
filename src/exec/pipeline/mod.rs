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
//! Pipeline execution contracts.
//!
//! Responsibilities:
//! - Defines the operator and factory traits a driver uses to move pages
//!   through a pipeline, plus the dependency/observer primitives operators use
//!   to signal blocked/unblocked transitions.
//!
//! Current limitations:
//! - Ships the contracts only; the driver loop lives with the embedder.

pub mod dependency;
pub mod observer;
pub mod operator;
pub mod operator_factory;

pub use dependency::{Dependency, DependencyHandle};
pub use operator::{Operator, ProcessorOperator};
pub use operator_factory::OperatorFactory;
