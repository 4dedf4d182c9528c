/*
 * Copyright 2021 Aon Cyber Solutions
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

pub mod acquire;
pub mod err;
pub mod hive;
pub mod locator;
pub mod memory;
pub mod normalize;
pub mod notatin_hive;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod sink;
pub mod util;
pub mod walker;
