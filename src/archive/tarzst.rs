use super::ArchiveBackend;
use crate::error::{ImportError, ImportResult, IoContext};
use crate::progress::PercentTracker;
use std::{
    ffi::OsString,
    io::{self, BufRead, BufReader, Read},
    path::Path,
    process::{Command, Output, Stdio},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

pub const EMBEDDED_CODEC_HINT: &str = "Failed to extract tar.zst archive. Please ensure you are using Windows 10 version 1803 or later.";

const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);
const PROGRESS_CEILING: f64 = 95.0;

/// How the external `tar` gets at the Zstandard codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecMode {
    /// `tar --use-compress-program=unzstd`.
    ExternalDecompressor,
    /// The tool detects zstd on its own. It cannot stream a single member to
    /// stdout, so metadata peeking is unavailable.
    Embedded,
}

impl CodecMode {
    pub fn for_host() -> Self {
        if cfg!(windows) {
            CodecMode::Embedded
        } else {
            CodecMode::ExternalDecompressor
        }
    }
}

/// TAR+Zstandard through an external `tar` process. When the tool is not
/// installed at all, the archive is decoded in-process instead.
#[derive(Debug, Clone)]
pub struct TarZstBackend {
    program: OsString,
    codec: CodecMode,
}

impl TarZstBackend {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            codec: CodecMode::for_host(),
        }
    }

    pub fn with_codec(mut self, codec: CodecMode) -> Self {
        self.codec = codec;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        if self.codec == CodecMode::ExternalDecompressor {
            command.arg("--use-compress-program=unzstd");
        }
        command
    }

    fn launch_error(&self, err: io::Error) -> ImportError {
        match self.codec {
            CodecMode::Embedded => ImportError::ToolLaunch(EMBEDDED_CODEC_HINT.to_string()),
            CodecMode::ExternalDecompressor => ImportError::ToolLaunch(format!(
                "failed to launch {}: {err}",
                self.program.to_string_lossy()
            )),
        }
    }

    fn run(&self, command: &mut Command) -> io::Result<Output> {
        command.stdin(Stdio::null()).output()
    }
}

impl ArchiveBackend for TarZstBackend {
    fn supports_metadata_peek(&self) -> bool {
        self.codec == CodecMode::ExternalDecompressor
    }

    fn list(&self, archive: &Path) -> ImportResult<Vec<String>> {
        let output = match self.run(self.command().arg("-tf").arg(archive)) {
            Ok(output) => output,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("tar not found, listing archive in-process");
                return native::list(archive);
            }
            Err(err) => return Err(self.launch_error(err)),
        };
        if !output.status.success() {
            return Err(ImportError::Tool(stderr_or(
                &output.stderr,
                "Failed to list archive contents".to_string(),
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    fn extract_all(
        &self,
        archive: &Path,
        dest: &Path,
        progress: &PercentTracker<'_>,
    ) -> ImportResult<()> {
        let mut command = self.command();
        command
            .arg("-xvf")
            .arg(archive)
            .arg("-C")
            .arg(dest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("tar not found, extracting archive in-process");
                return native::extract_all(archive, dest, progress);
            }
            Err(err) => return Err(self.launch_error(err)),
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let error_output = thread::scope(|scope| {
            let stderr_reader = scope.spawn(move || {
                let mut bytes = Vec::new();
                if let Some(mut stderr) = stderr {
                    let _ = stderr.read_to_end(&mut bytes);
                }
                bytes
            });

            if let Some(stdout) = stdout {
                let mut files_extracted = 0usize;
                let mut last_report = Instant::now();
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else {
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    files_extracted += 1;
                    if last_report.elapsed() > PROGRESS_INTERVAL {
                        progress.report(estimate_percent(files_extracted));
                        last_report = Instant::now();
                    }
                }
            }

            stderr_reader.join().unwrap_or_default()
        });

        let status = child.wait().io_context("wait for tar")?;
        if status.success() {
            progress.finish();
            return Ok(());
        }
        let fallback = match status.code() {
            Some(code) => format!("tar extraction failed with code {code}"),
            None => "tar extraction was terminated by a signal".to_string(),
        };
        Err(ImportError::Tool(stderr_or(&error_output, fallback)))
    }

    fn extract_one(&self, archive: &Path, entry: &str) -> ImportResult<Vec<u8>> {
        if !self.supports_metadata_peek() {
            return Err(ImportError::MetadataPeekUnsupported);
        }
        let output = match self.run(self.command().arg("-xf").arg(archive).arg(entry).arg("-O")) {
            Ok(output) => output,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return native::extract_one(archive, entry);
            }
            Err(err) => return Err(self.launch_error(err)),
        };
        if output.status.success() && !output.stdout.is_empty() {
            debug!(entry, bytes = output.stdout.len(), "read single tar member");
            return Ok(output.stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.is_empty() {
            Err(ImportError::DescriptorMissing)
        } else {
            Err(ImportError::Tool(stderr))
        }
    }
}

/// Rough percentage from the number of names `tar -v` has printed so far.
fn estimate_percent(files_extracted: usize) -> u8 {
    let estimate = (10.0 + files_extracted as f64 / 50.0).min(PROGRESS_CEILING);
    estimate.round() as u8
}

fn stderr_or(stderr: &[u8], fallback: String) -> String {
    let text = String::from_utf8_lossy(stderr).trim().to_string();
    if text.is_empty() {
        fallback
    } else {
        text
    }
}

mod native {
    use super::estimate_percent;
    use crate::error::{ImportError, ImportResult, IoContext};
    use crate::progress::PercentTracker;
    use std::{fs, io::Read, path::Path};
    use tar::Archive;
    use zstd::stream::read::Decoder;

    fn open(path: &Path) -> ImportResult<Archive<Decoder<'static, std::io::BufReader<fs::File>>>> {
        let file = fs::File::open(path).io_context(format!("open {}", path.display()))?;
        let decoder = Decoder::new(file).io_context("start zstd decoder")?;
        Ok(Archive::new(decoder))
    }

    fn normalize(name: &str) -> &str {
        name.trim().trim_start_matches("./")
    }

    pub(super) fn list(path: &Path) -> ImportResult<Vec<String>> {
        let mut archive = open(path)?;
        let mut names = Vec::new();
        for entry in archive.entries().io_context("read tar entries")? {
            let entry = entry.io_context("read tar entry")?;
            let name = entry.path().io_context("tar entry path")?;
            names.push(name.to_string_lossy().to_string());
        }
        Ok(names)
    }

    pub(super) fn extract_all(
        path: &Path,
        dest: &Path,
        progress: &PercentTracker<'_>,
    ) -> ImportResult<()> {
        let mut archive = open(path)?;
        let mut files_extracted = 0usize;
        for entry in archive.entries().io_context("read tar entries")? {
            let mut entry = entry.io_context("read tar entry")?;
            entry
                .unpack_in(dest)
                .io_context(format!("unpack into {}", dest.display()))?;
            files_extracted += 1;
            progress.report(estimate_percent(files_extracted));
        }
        progress.finish();
        Ok(())
    }

    pub(super) fn extract_one(path: &Path, wanted: &str) -> ImportResult<Vec<u8>> {
        let wanted = normalize(wanted);
        let mut archive = open(path)?;
        for entry in archive.entries().io_context("read tar entries")? {
            let mut entry = entry.io_context("read tar entry")?;
            let name = entry.path().io_context("tar entry path")?;
            if normalize(&name.to_string_lossy()) != wanted {
                continue;
            }
            let mut bytes = Vec::new();
            entry
                .read_to_end(&mut bytes)
                .io_context(format!("read {wanted} from archive"))?;
            return Ok(bytes);
        }
        Err(ImportError::DescriptorMissing)
    }
}
