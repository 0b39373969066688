//! Recognizer adapters.
//!
//! - `TesseractCli`: the `tesseract` executable on `PATH` (or a configured binary).
//! - `HttpRecognizer`: a sidecar HTTP service wrapping a neural engine.
//! - `MockRecognizer`: fixed output for tests and local development.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::warn;

use super::types::{EngineError, EngineId, LanguageHints, Recognizer};

// ── Tesseract ─────────────────────────────────────────────

/// Process deadline when none is configured.
pub const DEFAULT_TESSERACT_TIMEOUT: Duration = Duration::from_secs(60);

/// Map an ISO-639-1 code to the Tesseract traineddata name.
pub fn tesseract_language(code: &str) -> &str {
    match code {
        "en" => "eng",
        "ne" => "nep",
        "hi" => "hin",
        "fr" => "fra",
        "de" => "deu",
        "es" => "spa",
        "it" => "ita",
        "pt" => "por",
        "ru" => "rus",
        "zh" => "chi_sim",
        "ja" => "jpn",
        "ko" => "kor",
        "ar" => "ara",
        "bn" => "ben",
        other => other,
    }
}

/// Join hints into Tesseract's `-l` argument (`eng+nep`). Falls back to `eng`.
pub fn tesseract_language_arg(hints: &LanguageHints) -> String {
    if hints.is_empty() {
        return "eng".to_string();
    }
    hints
        .codes()
        .iter()
        .map(|c| tesseract_language(c))
        .collect::<Vec<_>>()
        .join("+")
}

/// Runs the Tesseract command line: `<image> stdout -l <langs> --oem 3 --psm 4`.
///
/// PSM 4 treats the page as a single column of variable-size text, which
/// suits cropped receipts and forms. A run that outlives `timeout` is killed
/// and reaped before `read` returns.
pub struct TesseractCli {
    id: EngineId,
    binary: PathBuf,
    timeout: Duration,
}

impl TesseractCli {
    pub fn new(id: impl Into<EngineId>) -> Self {
        Self {
            id: id.into(),
            binary: PathBuf::from("tesseract"),
            timeout: DEFAULT_TESSERACT_TIMEOUT,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run_process(&self, image: &Path, langs: &str) -> Result<Vec<String>, EngineError> {
        let mut child = Command::new(&self.binary)
            .arg(image)
            .arg("stdout")
            .args(["-l", langs, "--oem", "3", "--psm", "4"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => EngineError::Unavailable(format!(
                    "{} not found on PATH",
                    self.binary.display()
                )),
                _ => EngineError::Unavailable(format!("failed to start tesseract: {e}")),
            })?;

        // Drained in tasks so `child.wait()` can borrow the child
        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(EngineError::Internal(format!("waiting for tesseract failed: {e}")));
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(engine = %self.id, error = %e, "Failed to kill timed-out tesseract");
                }
                warn!(
                    engine = %self.id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Tesseract exceeded its timeout, killed"
                );
                return Err(EngineError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(EngineError::Internal(format!(
                "tesseract exited with {}: {}",
                status,
                stderr.trim()
            )));
        }

        Ok(split_lines(&String::from_utf8_lossy(&stdout)))
    }
}

impl Recognizer for TesseractCli {
    fn id(&self) -> &EngineId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "tesseract"
    }

    fn read(&self, image: &Path, hints: &LanguageHints) -> Result<Vec<String>, EngineError> {
        let langs = tesseract_language_arg(hints);
        // Called on a fanout worker thread, outside any runtime
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| EngineError::Internal(format!("process runtime setup failed: {e}")))?;
        runtime.block_on(self.run_process(image, &langs))
    }
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf).await;
    }
    buf
}

/// Non-blank lines of engine output, page-break characters removed.
fn split_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim_matches('\u{c}'))
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

// ── HTTP sidecar ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SidecarResponse {
    lines: Vec<String>,
}

/// Posts the enhanced PNG to `<url>?langs=en,ne` and expects `{"lines": [...]}`.
pub struct HttpRecognizer {
    id: EngineId,
    url: String,
    timeout: Duration,
}

impl HttpRecognizer {
    pub fn new(id: impl Into<EngineId>, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            timeout,
        }
    }
}

impl Recognizer for HttpRecognizer {
    fn id(&self) -> &EngineId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "http"
    }

    fn read(&self, image: &Path, hints: &LanguageHints) -> Result<Vec<String>, EngineError> {
        let body = std::fs::read(image).map_err(|e| {
            EngineError::Unavailable(format!("cannot read {}: {e}", image.display()))
        })?;

        // Built per call: the blocking client owns a runtime that must not be
        // dropped inside an async context.
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| EngineError::Internal(format!("HTTP client setup failed: {e}")))?;

        let response = client
            .post(&self.url)
            .query(&[("langs", hints.joined())])
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(body)
            .send()
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(EngineError::Internal(format!(
                "{} answered {status}: {}",
                self.url,
                detail.trim()
            )));
        }

        let parsed: SidecarResponse = response
            .json()
            .map_err(|e| EngineError::Internal(format!("invalid response from {}: {e}", self.url)))?;

        Ok(parsed
            .lines
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .collect())
    }
}

impl HttpRecognizer {
    fn classify(&self, err: reqwest::Error) -> EngineError {
        if err.is_timeout() {
            EngineError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else if err.is_connect() {
            EngineError::Unavailable(format!("cannot reach {}: {err}", self.url))
        } else {
            EngineError::Internal(format!("request to {} failed: {err}", self.url))
        }
    }
}

// ── Mock ──────────────────────────────────────────────────

/// Returns fixed lines after an optional delay, or a fixed error.
pub struct MockRecognizer {
    id: EngineId,
    lines: Vec<String>,
    delay: Duration,
    error: Option<EngineError>,
    panics: bool,
    calls: AtomicUsize,
}

impl MockRecognizer {
    pub fn new(id: impl Into<EngineId>, lines: &[&str]) -> Self {
        Self::from_lines(id, lines.iter().map(|l| l.to_string()).collect())
    }

    pub fn from_lines(id: impl Into<EngineId>, lines: Vec<String>) -> Self {
        Self {
            id: id.into(),
            lines,
            delay: Duration::ZERO,
            error: None,
            panics: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(id: impl Into<EngineId>, error: EngineError) -> Self {
        Self {
            error: Some(error),
            ..Self::from_lines(id, Vec::new())
        }
    }

    /// Panics inside `read`, like a misbehaving native binding would.
    pub fn panicking(id: impl Into<EngineId>) -> Self {
        Self {
            panics: true,
            ..Self::from_lines(id, Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Recognizer for MockRecognizer {
    fn id(&self) -> &EngineId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "mock"
    }

    fn read(&self, _image: &Path, _hints: &LanguageHints) -> Result<Vec<String>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.panics {
            panic!("mock recognizer {} panicked", self.id);
        }
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(self.lines.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn hints() -> LanguageHints {
        LanguageHints::new(["en", "ne"])
    }

    /// One-shot HTTP server answering with a canned response. Returns the URL.
    fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            let response = format!(
                "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
        });
        format!("http://{addr}/ocr")
    }

    /// Drain headers and the Content-Length body so the client sees a clean exchange.
    fn read_request(stream: &mut std::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = find_subslice(&buf, b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let length = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                while buf.len() < end + 4 + length {
                    let n = stream.read(&mut chunk).unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                return;
            }
        }
    }

    fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    fn temp_image() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enhanced.png");
        std::fs::write(&path, b"\x89PNG fake").unwrap();
        (dir, path)
    }

    #[test]
    fn language_arg_maps_iso_codes() {
        assert_eq!(tesseract_language_arg(&hints()), "eng+nep");
        assert_eq!(tesseract_language_arg(&LanguageHints::default()), "eng");
        assert_eq!(tesseract_language_arg(&LanguageHints::new(["xx"])), "xx");
    }

    #[test]
    fn split_lines_drops_blank_and_form_feed() {
        let lines = split_lines("INVOICE 2024\n\n  \nTotal 42\n\u{c}");
        assert_eq!(lines, vec!["INVOICE 2024", "Total 42"]);
    }

    #[test]
    fn missing_tesseract_binary_is_unavailable() {
        let (_dir, image) = temp_image();
        let engine = TesseractCli::new("tesseract").with_binary("/nonexistent/bin/tesseract");
        let err = engine.read(&image, &hints()).unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn timed_out_tesseract_process_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        // Passed where the image path goes; `sh` runs it as a script
        let script = dir.path().join("hang.sh");
        std::fs::write(
            &script,
            format!("echo $$ > {}\nexec sleep 5\n", pid_file.display()),
        )
        .unwrap();

        let engine = TesseractCli::new("tesseract")
            .with_binary("/bin/sh")
            .with_timeout(Duration::from_millis(500));

        let started = std::time::Instant::now();
        let err = engine.read(&script, &hints()).unwrap_err();
        assert_eq!(err, EngineError::Timeout { timeout_ms: 500 });
        assert!(started.elapsed() < Duration::from_secs(3));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let proc_dir = PathBuf::from(format!("/proc/{}", pid.trim()));
        assert!(!proc_dir.exists(), "process {} still alive", pid.trim());
    }

    #[cfg(unix)]
    #[test]
    fn tesseract_nonzero_exit_is_internal() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fail.sh");
        std::fs::write(&script, "echo 'Error opening data file' >&2\nexit 1\n").unwrap();

        let engine = TesseractCli::new("tesseract").with_binary("/bin/sh");
        let err = engine.read(&script, &hints()).unwrap_err();
        assert!(matches!(err, EngineError::Internal(ref m) if m.contains("Error opening data file")));
    }

    #[test]
    fn http_success_returns_lines() {
        let (_dir, image) = temp_image();
        let url = serve_once("HTTP/1.1 200 OK", r#"{"lines": ["INVOICE 2024", " ", "Total"]}"#);
        let engine = HttpRecognizer::new("easyocr", url, Duration::from_secs(5));

        let lines = engine.read(&image, &hints()).unwrap();
        assert_eq!(lines, vec!["INVOICE 2024", "Total"]);
    }

    #[test]
    fn http_error_status_is_internal() {
        let (_dir, image) = temp_image();
        let url = serve_once("HTTP/1.1 500 Internal Server Error", r#"{"error": "model crashed"}"#);
        let engine = HttpRecognizer::new("easyocr", url, Duration::from_secs(5));

        let err = engine.read(&image, &hints()).unwrap_err();
        assert!(matches!(err, EngineError::Internal(ref m) if m.contains("500")));
    }

    #[test]
    fn http_invalid_json_is_internal() {
        let (_dir, image) = temp_image();
        let url = serve_once("HTTP/1.1 200 OK", r#"{"text": "wrong shape"}"#);
        let engine = HttpRecognizer::new("easyocr", url, Duration::from_secs(5));

        assert!(matches!(
            engine.read(&image, &hints()),
            Err(EngineError::Internal(_))
        ));
    }

    #[test]
    fn http_connection_refused_is_unavailable() {
        let (_dir, image) = temp_image();
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        // Listener dropped: nothing accepts on this port anymore
        let engine = HttpRecognizer::new("paddle", format!("http://{addr}/ocr"), Duration::from_secs(5));

        assert!(matches!(
            engine.read(&image, &hints()),
            Err(EngineError::Unavailable(_))
        ));
    }

    #[test]
    fn http_silent_server_times_out() {
        let (_dir, image) = temp_image();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            std::thread::sleep(Duration::from_secs(2));
        });

        let engine = HttpRecognizer::new("surya", format!("http://{addr}/ocr"), Duration::from_millis(200));
        assert!(matches!(
            engine.read(&image, &hints()),
            Err(EngineError::Timeout { timeout_ms: 200 })
        ));
    }

    #[test]
    fn mock_counts_calls_and_returns_lines() {
        let engine = MockRecognizer::new("mock", &["a line"]);
        let lines = engine.read(Path::new("x.png"), &hints()).unwrap();
        assert_eq!(lines, vec!["a line"]);
        assert_eq!(engine.call_count(), 1);
    }

    #[test]
    fn mock_failing_returns_error() {
        let engine = MockRecognizer::failing("mock", EngineError::Unavailable("offline".into()));
        assert_eq!(
            engine.read(Path::new("x.png"), &hints()).unwrap_err(),
            EngineError::Unavailable("offline".into())
        );
    }
}
