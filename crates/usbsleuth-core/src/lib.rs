/// UsbSleuth Core: offline USB device history from Windows evidence.
///
/// Reads registry hives and setupapi install logs copied off a Windows
/// system and correlates them into one record per USB mass-storage device.
/// No CLI dependencies; the binary crate is a thin wrapper over [`engine::run`].
///
/// # Modules
///
/// - [`hive`]: read-only registry trees: the on-disk `regf` reader, an
///   in-memory tree and a `regf` writer for fixtures.
/// - [`model`]: device records and the identity registry they live in.
/// - [`passes`]: SYSTEM, SOFTWARE and NTUSER enrichment passes.
/// - [`install_log`]: setupapi log indexing and install-time matching.
/// - [`os_version`]: Windows release table and log grammar selection.
/// - [`discovery`]: finds and classifies evidence files.
/// - [`engine`]: runs the passes in order over discovered evidence.
/// - [`report`]: text, CSV and JSON renderers.
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod hive;
pub mod install_log;
pub mod model;
pub mod os_version;
pub mod passes;
pub mod report;

pub use config::RunConfig;
pub use engine::{run, Correlator, RunOutcome, RunSummary};
pub use error::{CorrelateError, HiveError};
pub use report::{write_report, ReportFormat};
