//! `recurmail-scheduler` — recurring email jobs with SQLite persistence.
//!
//! # Overview
//!
//! Jobs live in a SQLite `jobs` table. The [`engine::Scheduler`] wakes on a
//! fixed tick, selects every active job whose `next_send` has arrived and
//! hands each to the [`dispatch::Dispatcher`]. The outcome is folded back
//! through [`lifecycle`] into a partial update of the job row.
//!
//! # Job lifecycle
//!
//! | From     | Operation        | To       | Timing                                   |
//! |----------|------------------|----------|------------------------------------------|
//! | (new)    | create           | `Active` | `next_send = now + N days`               |
//! | `Active` | send succeeded   | `Active` | `last_sent = t`, `next_send = t + N`     |
//! | `Active` | send failed      | `Active` | unchanged, retried next tick             |
//! | `Active` | pause            | `Paused` | unchanged                                |
//! | `Paused` | resume           | `Active` | `next_send = (last_sent ?? now) + N`     |
//! | any live | delete           | `Deleted`| terminal, invisible to every read        |

pub mod broker;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod schedule;
pub mod store;

pub use broker::CredentialBroker;
pub use dispatch::Dispatcher;
pub use engine::{Scheduler, SchedulerOptions, TickReport};
pub use error::{Result, SchedulerError};
pub use lifecycle::{JobManager, JobPatch, NewJob};
pub use store::{JobStore, JobUpdate, SqliteStore};
