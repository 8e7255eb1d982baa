//! Pipeline orchestration
//!
//! Sequences the whole run: drain leftover local exports, bring the tunnel
//! up, download the new batch, parse, persist, archive, notify, and tear
//! the tunnel down no matter which stage failed. The tunnel teardown is the
//! one resource with a mandatory always-release discipline, enforced here
//! with a scoped guard.

use crate::archive::archive_batch;
use crate::error::{PipelineError, Result};
use crate::ftp::RemoteSource;
use crate::notify::Mailer;
use crate::parser::{has_export_files, ExportParser};
use crate::store::MeterStore;
use crate::tunnel::Tunnel;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

// ============================================================================
// STAGES
// ============================================================================

/// Progression of one pipeline run. A failure in any stage detours through
/// `Disconnecting` before the run returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    LocalDrain,
    Connecting,
    Downloading,
    Processing,
    Archiving,
    Notifying,
    Disconnecting,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "Idle",
            Stage::LocalDrain => "LocalDrain",
            Stage::Connecting => "Connecting",
            Stage::Downloading => "Downloading",
            Stage::Processing => "Processing",
            Stage::Archiving => "Archiving",
            Stage::Notifying => "Notifying",
            Stage::Disconnecting => "Disconnecting",
            Stage::Done => "Done",
            Stage::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// What one run accomplished.
#[derive(Debug)]
pub struct RunReport {
    /// Final stage; `Done` for every successful run.
    pub stage: Stage,
    /// Readings recovered from leftovers of an interrupted prior run.
    pub drained: usize,
    /// Files retrieved from the mailbox this run.
    pub downloaded: usize,
    /// New readings persisted (duplicates excluded).
    pub inserted: usize,
    /// Archive written for the downloaded batch, if any.
    pub archive: Option<PathBuf>,
    /// Whether the completion email went out.
    pub notified: bool,
}

impl RunReport {
    fn new() -> Self {
        RunReport {
            stage: Stage::Idle,
            drained: 0,
            downloaded: 0,
            inserted: 0,
            archive: None,
            notified: false,
        }
    }
}

// ============================================================================
// TUNNEL GUARD
// ============================================================================

/// Scoped handle on the tunnel: disconnect fires exactly once, on the normal
/// path and on every error path (including unwind).
struct TunnelGuard<'a> {
    tunnel: &'a mut dyn Tunnel,
    released: bool,
}

impl<'a> TunnelGuard<'a> {
    fn new(tunnel: &'a mut dyn Tunnel) -> Self {
        TunnelGuard {
            tunnel,
            released: false,
        }
    }

    fn connect(&mut self) -> bool {
        self.tunnel.connect()
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            info!(stage = %Stage::Disconnecting, "tearing down tunnel");
            self.tunnel.disconnect();
        }
    }
}

impl Drop for TunnelGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    download_dir: PathBuf,
    backup_dir: PathBuf,
    summary_path: PathBuf,
    parser: ExportParser,
    store: MeterStore,
    tunnel: Box<dyn Tunnel>,
    source: Box<dyn RemoteSource>,
    mailer: Box<dyn Mailer>,
}

impl Pipeline {
    pub fn new(
        download_dir: PathBuf,
        backup_dir: PathBuf,
        summary_path: PathBuf,
        store: MeterStore,
        tunnel: Box<dyn Tunnel>,
        source: Box<dyn RemoteSource>,
        mailer: Box<dyn Mailer>,
    ) -> Self {
        let parser = ExportParser::new(summary_path.clone());
        Pipeline {
            download_dir,
            backup_dir,
            summary_path,
            parser,
            store,
            tunnel,
            source,
            mailer,
        }
    }

    /// Execute one full run.
    ///
    /// Whatever the outcome, the tunnel is disconnected exactly once before
    /// this returns.
    pub fn run(&mut self) -> Result<RunReport> {
        let Pipeline {
            download_dir,
            backup_dir,
            summary_path,
            parser,
            store,
            tunnel,
            source,
            mailer,
        } = self;

        let mut guard = TunnelGuard::new(tunnel.as_mut());
        let result = drive(
            &mut guard,
            source.as_mut(),
            mailer.as_ref(),
            parser,
            store,
            download_dir,
            backup_dir,
            summary_path,
        );
        guard.release();

        match &result {
            Ok(report) => info!(
                drained = report.drained,
                downloaded = report.downloaded,
                inserted = report.inserted,
                notified = report.notified,
                "pipeline run complete"
            ),
            Err(e) => error!(stage = %Stage::Failed, error = %e, "pipeline run failed"),
        }
        result
    }
}

fn drive(
    tunnel: &mut TunnelGuard<'_>,
    source: &mut dyn RemoteSource,
    mailer: &dyn Mailer,
    parser: &ExportParser,
    store: &mut MeterStore,
    download_dir: &Path,
    backup_dir: &Path,
    summary_path: &Path,
) -> Result<RunReport> {
    let mut report = RunReport::new();

    // Leftovers from an interrupted run are processed before any network
    // I/O, which makes the pipeline self-healing across crashes.
    report.stage = Stage::LocalDrain;
    if has_export_files(download_dir) {
        info!(stage = %report.stage, "leftover exports found; draining first");
        let readings = parser
            .parse(download_dir)
            .map_err(|e| fail(Stage::LocalDrain, e))?;
        report.drained = readings.len();
        report.inserted += store
            .upsert(&readings)
            .map_err(|e| fail(Stage::LocalDrain, e))?;
        archive_batch(download_dir, backup_dir).map_err(|e| fail(Stage::LocalDrain, e))?;
    }

    report.stage = Stage::Connecting;
    if !tunnel.connect() {
        return Err(fail(
            Stage::Connecting,
            PipelineError::Connection("tunnel could not be established".to_string()),
        ));
    }

    report.stage = Stage::Downloading;
    let downloaded = source
        .download_all(download_dir)
        .map_err(|e| fail(Stage::Downloading, e))?;
    report.downloaded = downloaded.len();
    if downloaded.is_empty() {
        info!(stage = %report.stage, "mailbox empty; nothing to process");
        report.stage = Stage::Done;
        return Ok(report);
    }

    report.stage = Stage::Processing;
    let readings = parser
        .parse(download_dir)
        .map_err(|e| fail(Stage::Processing, e))?;
    report.inserted += store
        .upsert(&readings)
        .map_err(|e| fail(Stage::Processing, e))?;

    report.stage = Stage::Archiving;
    report.archive =
        Some(archive_batch(download_dir, backup_dir).map_err(|e| fail(Stage::Archiving, e))?);

    report.stage = Stage::Notifying;
    report.notified = mailer.send(&[summary_path.to_path_buf()]);
    if !report.notified {
        warn!(stage = %report.stage, "notification failed; run continues");
    }

    report.stage = Stage::Done;
    Ok(report)
}

/// Log a stage failure with its cause and pass the error through.
fn fail(stage: Stage, err: PipelineError) -> PipelineError {
    error!(stage = %stage, error = %err, "stage failed");
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::fs;
    use std::rc::Rc;
    use tempfile::TempDir;

    // ------------------------------------------------------------------
    // Mock collaborators
    // ------------------------------------------------------------------

    #[derive(Clone, Default)]
    struct Counters {
        connects: Rc<Cell<usize>>,
        disconnects: Rc<Cell<usize>>,
        sends: Rc<Cell<usize>>,
        dir_empty_at_connect: Rc<Cell<bool>>,
    }

    struct MockTunnel {
        counters: Counters,
        connect_ok: bool,
        watched_dir: Option<PathBuf>,
    }

    impl Tunnel for MockTunnel {
        fn connect(&mut self) -> bool {
            self.counters.connects.set(self.counters.connects.get() + 1);
            if let Some(dir) = &self.watched_dir {
                self.counters
                    .dir_empty_at_connect
                    .set(!has_export_files(dir));
            }
            self.connect_ok
        }

        fn disconnect(&mut self) -> bool {
            self.counters
                .disconnects
                .set(self.counters.disconnects.get() + 1);
            true
        }
    }

    enum SourceBehavior {
        Empty,
        Files(Vec<(String, String)>),
        Fail,
    }

    struct MockSource {
        behavior: SourceBehavior,
    }

    impl RemoteSource for MockSource {
        fn download_all(&mut self, target_dir: &Path) -> Result<Vec<PathBuf>> {
            match &self.behavior {
                SourceBehavior::Empty => Ok(Vec::new()),
                SourceBehavior::Files(files) => {
                    let mut paths = Vec::new();
                    for (name, content) in files {
                        let path = target_dir.join(name);
                        fs::write(&path, content).unwrap();
                        paths.push(path);
                    }
                    Ok(paths)
                }
                SourceBehavior::Fail => Err(PipelineError::Transfer(
                    "session dropped".to_string(),
                )),
            }
        }
    }

    struct MockMailer {
        counters: Counters,
        ok: bool,
        attachments_seen: Rc<RefCell<Vec<PathBuf>>>,
    }

    impl Mailer for MockMailer {
        fn send(&self, attachments: &[PathBuf]) -> bool {
            self.counters.sends.set(self.counters.sends.get() + 1);
            self.attachments_seen
                .borrow_mut()
                .extend(attachments.iter().cloned());
            self.ok
        }
    }

    // ------------------------------------------------------------------
    // Harness
    // ------------------------------------------------------------------

    struct Harness {
        base: TempDir,
        counters: Counters,
        attachments: Rc<RefCell<Vec<PathBuf>>>,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                base: TempDir::new().unwrap(),
                counters: Counters::default(),
                attachments: Rc::new(RefCell::new(Vec::new())),
            }
        }

        fn download_dir(&self) -> PathBuf {
            let dir = self.base.path().join("download");
            fs::create_dir_all(&dir).unwrap();
            dir
        }

        fn pipeline(
            &self,
            connect_ok: bool,
            behavior: SourceBehavior,
            mail_ok: bool,
        ) -> Pipeline {
            let download_dir = self.download_dir();
            let tunnel = MockTunnel {
                counters: self.counters.clone(),
                connect_ok,
                watched_dir: Some(download_dir.clone()),
            };
            let mailer = MockMailer {
                counters: self.counters.clone(),
                ok: mail_ok,
                attachments_seen: Rc::clone(&self.attachments),
            };
            Pipeline::new(
                download_dir,
                self.base.path().join("backup"),
                self.base.path().join("summary.csv"),
                MeterStore::open_in_memory().unwrap(),
                Box::new(tunnel),
                Box::new(MockSource { behavior }),
                Box::new(mailer),
            )
        }
    }

    /// A valid export body: name/date on row 1, value on row 8.
    fn export_body(meter: &str, date: &str, value: &str) -> String {
        let mut lines = vec!["h,x,x,x,x".to_string()];
        lines.push(format!("{meter},x,x,x,{date}"));
        for _ in 2..8 {
            lines.push("x,x".to_string());
        }
        lines.push(format!("x,{value}"));
        lines.join("\n")
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[test]
    fn full_run_processes_downloads() {
        let h = Harness::new();
        let files = vec![
            (
                "METER1_A@20240101.csv".to_string(),
                export_body("METER1_A", "2024-01-01 00:15", "42"),
            ),
            (
                "METER2_B@20240101.csv".to_string(),
                export_body("METER2_B", "2024-01-01 00:15", "7.5"),
            ),
        ];
        let mut pipeline = h.pipeline(true, SourceBehavior::Files(files), true);

        let report = pipeline.run().unwrap();

        assert_eq!(report.stage, Stage::Done);
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.inserted, 2);
        assert!(report.notified);
        assert!(report.archive.unwrap().exists());
        // Download dir was emptied by the archive step.
        assert!(!has_export_files(&h.download_dir()));
        // Summary went out as the attachment.
        assert_eq!(
            *h.attachments.borrow(),
            vec![h.base.path().join("summary.csv")]
        );
        assert_eq!(h.counters.connects.get(), 1);
        assert_eq!(h.counters.disconnects.get(), 1);
    }

    #[test]
    fn empty_mailbox_skips_processing_and_notifying() {
        let h = Harness::new();
        let mut pipeline = h.pipeline(true, SourceBehavior::Empty, true);

        let report = pipeline.run().unwrap();

        assert_eq!(report.stage, Stage::Done);
        assert_eq!(report.downloaded, 0);
        assert_eq!(report.inserted, 0);
        assert!(report.archive.is_none());
        assert!(!report.notified);
        assert_eq!(h.counters.sends.get(), 0);
        // Straight to Disconnecting: teardown still happens.
        assert_eq!(h.counters.disconnects.get(), 1);
    }

    #[test]
    fn connect_failure_aborts_run_but_disconnects() {
        let h = Harness::new();
        let mut pipeline = h.pipeline(false, SourceBehavior::Empty, true);

        let err = pipeline.run();

        assert!(matches!(err, Err(PipelineError::Connection(_))));
        assert_eq!(h.counters.sends.get(), 0);
        assert_eq!(h.counters.disconnects.get(), 1);
    }

    #[test]
    fn transfer_failure_disconnects_exactly_once() {
        let h = Harness::new();
        let mut pipeline = h.pipeline(true, SourceBehavior::Fail, true);

        let err = pipeline.run();

        assert!(matches!(err, Err(PipelineError::Transfer(_))));
        assert_eq!(h.counters.disconnects.get(), 1);
    }

    #[test]
    fn parse_failure_disconnects_exactly_once() {
        let h = Harness::new();
        let files = vec![(
            "BAD_M@1.csv".to_string(),
            export_body("BAD_M", "2024-01-01", "not-a-number"),
        )];
        let mut pipeline = h.pipeline(true, SourceBehavior::Files(files), true);

        let err = pipeline.run();

        assert!(matches!(err, Err(PipelineError::Parse(_))));
        assert_eq!(h.counters.sends.get(), 0);
        assert_eq!(h.counters.disconnects.get(), 1);
        // The malformed batch stays in place for inspection/retry.
        assert!(has_export_files(&h.download_dir()));
    }

    #[test]
    fn archive_failure_disconnects_exactly_once() {
        let h = Harness::new();
        let files = vec![(
            "METER1_A@1.csv".to_string(),
            export_body("METER1_A", "2024-01-01", "42"),
        )];
        let mut pipeline = h.pipeline(true, SourceBehavior::Files(files), true);
        // A file squatting on the backup path makes archiving fail.
        fs::write(h.base.path().join("backup"), "in the way").unwrap();

        let err = pipeline.run();

        assert!(matches!(err, Err(PipelineError::Archive(_))));
        assert_eq!(h.counters.disconnects.get(), 1);
        // Archive failure leaves the sources for retry.
        assert!(has_export_files(&h.download_dir()));
    }

    #[test]
    fn notification_failure_does_not_fail_the_run() {
        let h = Harness::new();
        let files = vec![(
            "METER1_A@1.csv".to_string(),
            export_body("METER1_A", "2024-01-01", "42"),
        )];
        let mut pipeline = h.pipeline(true, SourceBehavior::Files(files), false);

        let report = pipeline.run().unwrap();

        assert_eq!(report.stage, Stage::Done);
        assert!(!report.notified);
        assert_eq!(h.counters.sends.get(), 1);
        assert_eq!(h.counters.disconnects.get(), 1);
    }

    #[test]
    fn leftovers_are_drained_before_the_network_is_touched() {
        let h = Harness::new();
        let download_dir = h.download_dir();
        fs::write(
            download_dir.join("METER9_Z@stale.csv"),
            export_body("METER9_Z", "2023-12-31", "10"),
        )
        .unwrap();
        let mut pipeline = h.pipeline(true, SourceBehavior::Empty, true);

        let report = pipeline.run().unwrap();

        assert_eq!(report.drained, 1);
        assert_eq!(report.inserted, 1);
        // The leftover was archived away before connect() ran.
        assert!(h.counters.dir_empty_at_connect.get());
        assert_eq!(h.counters.connects.get(), 1);
        assert_eq!(h.counters.disconnects.get(), 1);
    }

    #[test]
    fn rerun_over_same_batch_inserts_nothing_new() {
        let h = Harness::new();
        let files = vec![(
            "METER1_A@1.csv".to_string(),
            export_body("METER1_A", "2024-01-01 00:15", "42"),
        )];

        // Two separate pipelines against the same store file.
        let db_path = h.base.path().join("readings.db");
        for expected_inserted in [1usize, 0] {
            let tunnel = MockTunnel {
                counters: h.counters.clone(),
                connect_ok: true,
                watched_dir: None,
            };
            let mailer = MockMailer {
                counters: h.counters.clone(),
                ok: true,
                attachments_seen: Rc::clone(&h.attachments),
            };
            let mut pipeline = Pipeline::new(
                h.download_dir(),
                h.base.path().join("backup"),
                h.base.path().join("summary.csv"),
                MeterStore::open(&db_path).unwrap(),
                Box::new(tunnel),
                Box::new(MockSource {
                    behavior: SourceBehavior::Files(files.clone()),
                }),
                Box::new(mailer),
            );
            let report = pipeline.run().unwrap();
            assert_eq!(report.inserted, expected_inserted);
        }

        let store = MeterStore::open(&db_path).unwrap();
        assert_eq!(store.reading_count().unwrap(), 1);
    }
}
