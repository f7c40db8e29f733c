use super::ArchiveBackend;
use crate::error::{ImportError, ImportResult, IoContext};
use crate::metadata;
use crate::progress::PercentTracker;
use filetime::{set_file_mtime, FileTime};
use std::{
    fs,
    io::{self, BufReader, Read},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    thread,
};
use time::{Date, Month, PrimitiveDateTime, Time as TimeOfDay};
use tracing::{debug, warn};
use zip::ZipArchive;

const MAX_WORKERS: usize = 8;

/// ZIP handling through the `zip` crate. Full extraction fans entries out over
/// a small pool of readers, each holding its own handle on the archive.
#[derive(Debug, Clone)]
pub struct ZipBackend {
    workers: usize,
}

impl Default for ZipBackend {
    fn default() -> Self {
        let workers = thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(2)
            .min(MAX_WORKERS);
        Self { workers }
    }
}

impl ZipBackend {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }
}

type ZipReader = ZipArchive<BufReader<fs::File>>;

fn open_zip(path: &Path) -> ImportResult<ZipReader> {
    let file = fs::File::open(path).io_context(format!("open {}", path.display()))?;
    Ok(ZipArchive::new(BufReader::new(file))?)
}

impl ArchiveBackend for ZipBackend {
    fn list(&self, archive: &Path) -> ImportResult<Vec<String>> {
        let mut zip = open_zip(archive)?;
        let mut names = Vec::with_capacity(zip.len());
        for index in 0..zip.len() {
            names.push(zip.by_index_raw(index)?.name().to_string());
        }
        Ok(names)
    }

    fn extract_all(
        &self,
        archive: &Path,
        dest: &Path,
        progress: &PercentTracker<'_>,
    ) -> ImportResult<()> {
        let total = open_zip(archive)?.len();
        if total == 0 {
            progress.finish();
            return Ok(());
        }

        let workers = self.workers.clamp(1, total);
        let processed = AtomicUsize::new(0);
        let aborted = AtomicBool::new(false);
        let failure: Mutex<Option<ImportError>> = Mutex::new(None);
        debug!(entries = total, workers, "extracting zip");

        thread::scope(|scope| {
            for worker in 0..workers {
                let processed = &processed;
                let aborted = &aborted;
                let failure = &failure;
                scope.spawn(move || {
                    let on_entry = || {
                        let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                        progress.report_ratio(done, total);
                    };
                    let result =
                        extract_stripe(archive, dest, worker, workers, aborted, &on_entry);
                    if let Err(err) = result {
                        // First error wins; the rest are dropped.
                        if !aborted.swap(true, Ordering::SeqCst) {
                            if let Ok(mut slot) = failure.lock() {
                                *slot = Some(err);
                            }
                        }
                    }
                });
            }
        });

        let failure = match failure.into_inner() {
            Ok(failure) => failure,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(err) = failure {
            return Err(err);
        }
        progress.finish();
        Ok(())
    }

    fn extract_one(&self, archive: &Path, entry: &str) -> ImportResult<Vec<u8>> {
        let mut zip = open_zip(archive)?;
        let mut file = zip.by_name(entry)?;
        let mut bytes = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut bytes)
            .io_context(format!("read {entry} from archive"))?;
        Ok(bytes)
    }

    /// Walks entries in archive order and stops at the first descriptor.
    fn read_descriptor(&self, archive: &Path) -> ImportResult<Vec<u8>> {
        let mut zip = open_zip(archive)?;
        for index in 0..zip.len() {
            let mut file = zip.by_index(index)?;
            if file.is_dir() || !metadata::is_descriptor_entry(file.name()) {
                continue;
            }
            let mut bytes = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut bytes)
                .io_context("read metadata.json from archive")?;
            return Ok(bytes);
        }
        Err(ImportError::DescriptorMissing)
    }
}

fn extract_stripe(
    archive: &Path,
    dest: &Path,
    worker: usize,
    stride: usize,
    aborted: &AtomicBool,
    on_entry: &dyn Fn(),
) -> ImportResult<()> {
    let mut zip = open_zip(archive)?;
    for index in (worker..zip.len()).step_by(stride) {
        if aborted.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut file = zip.by_index(index)?;
        let Some(relative) = file.enclosed_name() else {
            warn!(entry = file.name(), "skipping zip entry with unsafe path");
            on_entry();
            continue;
        };
        let out_path = dest.join(relative);

        if file.is_dir() {
            fs::create_dir_all(&out_path)
                .io_context(format!("create {}", out_path.display()))?;
            on_entry();
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).io_context(format!("create {}", parent.display()))?;
        }
        let mut out_file = fs::File::create(&out_path)
            .io_context(format!("write {}", out_path.display()))?;
        io::copy(&mut file, &mut out_file)
            .io_context(format!("extract {}", out_path.display()))?;
        if let Some(mtime) = file.last_modified().and_then(zip_time_to_unix) {
            let _ = set_file_mtime(&out_path, FileTime::from_unix_time(mtime, 0));
        }
        on_entry();
    }
    Ok(())
}

fn zip_time_to_unix(dt: zip::DateTime) -> Option<i64> {
    let month = Month::try_from(dt.month()).ok()?;
    let date = Date::from_calendar_date(dt.year() as i32, month, dt.day()).ok()?;
    let time = TimeOfDay::from_hms(dt.hour(), dt.minute(), dt.second()).ok()?;
    let datetime = PrimitiveDateTime::new(date, time).assume_utc();
    Some(datetime.unix_timestamp())
}
