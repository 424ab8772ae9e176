//! Work domains of the case-management job subsystem and the process wiring
//! that runs them.
//!
//! | queue                 | jobs                                         |
//! |-----------------------|----------------------------------------------|
//! | `court-sync`          | `sync-batch`, `sync-case`                    |
//! | `email-campaign`      | `send-campaign`, `send-campaign-email`       |
//! | `publication-monitor` | `monitor-publications`, `fetch-publications` |
//! | `csv-export`          | `export-csv`                                 |
//! | `chat-notification`   | `chat-notification`                          |

pub mod campaigns;
pub mod court_sync;
pub mod exports;
pub mod notifications;
pub mod publications;
pub mod runtime;
pub mod schedules;
pub mod sources;

pub use campaigns::CampaignHandler;
pub use court_sync::{CasePages, CourtSyncHandler, sync_batch_job_id, sync_case_job_id};
pub use exports::{ExportHandler, render_csv};
pub use notifications::ChatHandler;
pub use publications::PublicationHandler;
pub use runtime::{Collaborators, Runtime, SCHEDULER_LEASE, Stores};
pub use schedules::{DailyPublicationMonitor, DeadLetterCleanup, NightlyCourtSync};
