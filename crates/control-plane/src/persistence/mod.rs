use sqlx::SqlitePool;

pub mod audit;
pub mod commands;
pub mod credentials;
pub mod devices;
pub mod migrations;
pub mod sessions;

pub type Db = SqlitePool;

pub use audit::{AuditLogRecord, NewAuditLog};
pub use commands::{CommandRecord, CommandStatus, NewCommand};
pub use credentials::{CallerClass, CredentialRecord, CredentialUpdate, NewCredential};
pub use devices::{DeviceListFilters, DeviceRecord, DeviceSortColumn, DeviceStatus, DeviceUpsert};
pub use migrations::{MigrationLabel, MigrationRunOutcome, MigrationSnapshot};
pub use sessions::{NewSession, SessionRecord, SessionWithCredential};
