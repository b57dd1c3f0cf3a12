// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The two long-lived worker loops.
//!
//! The command worker is the single consumer of the command queue and the
//! only place caller-initiated firmware sequences run. The event worker is
//! the single consumer of the event queue and the only place
//! firmware-initiated state changes and application callbacks run. The
//! event worker never waits on the command worker; follow-up firmware work
//! is enqueued as a command and picked up independently.

pub mod command;
pub mod event;
