use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const SERVE_FOREVER: &str = "echo $$ > server.pid; exec sleep 30";

/// A site root with a generated Output/index.html and a preview.toml whose
/// server command is the given shell script.
fn site(server_script: &str) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("Output")).unwrap();
    std::fs::write(dir.path().join("Output/index.html"), "<h1>hello</h1>").unwrap();
    write_config(dir.path(), server_script);
    dir
}

fn write_config(root: &Path, server_script: &str) {
    let script = toml::Value::String(server_script.to_string());
    let config = format!(
        "[server]\ncommand = \"sh\"\nargs = [\"-c\", {script}]\n\n[shutdown]\ngrace_period_ms = 2000\n"
    );
    std::fs::write(root.join("preview.toml"), config).unwrap();
}

fn preview(root: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_preview-server"));
    cmd.arg("--root")
        .arg(root)
        .arg("--config")
        .arg(root.join("preview.toml"))
        .arg("--port")
        .arg("8000");
    cmd
}

fn spawn_interactive(root: &Path) -> Child {
    preview(root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap()
}

/// Read stdout until the banner's stop instruction shows up.
fn wait_for_banner(child: &mut Child) -> String {
    let stdout = child.stdout.take().unwrap();
    let mut banner = String::new();
    for line in BufReader::new(stdout).lines() {
        let line = line.unwrap();
        banner.push_str(&line);
        banner.push('\n');
        if line.contains("CTRL+C") {
            return banner;
        }
    }
    panic!("preview exited before printing its banner: {banner}");
}

fn wait_for_pid(path: PathBuf) -> i32 {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Ok(contents) = std::fs::read_to_string(&path) {
            if let Ok(pid) = contents.trim().parse() {
                return pid;
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("server never wrote {}", path.display());
}

fn is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

#[test]
fn test_newline_stops_server_with_status_zero() {
    let dir = site(SERVE_FOREVER);
    let mut child = spawn_interactive(dir.path());

    let banner = wait_for_banner(&mut child);
    assert!(banner.contains("http://localhost:8000"));
    let server = wait_for_pid(dir.path().join("Output/server.pid"));
    assert!(is_alive(server));

    child.stdin.as_mut().unwrap().write_all(b"\n").unwrap();
    let status = child.wait().unwrap();

    assert_eq!(status.code(), Some(0));
    assert!(!is_alive(server));
}

#[test]
fn test_end_of_input_exits_zero() {
    let dir = site(SERVE_FOREVER);
    let output = preview(dir.path())
        .stdin(Stdio::null())
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains("http://localhost:8000"));
}

#[test]
fn test_interrupt_kills_preview_by_signal_and_stops_server() {
    let dir = site(SERVE_FOREVER);
    let mut child = spawn_interactive(dir.path());

    wait_for_banner(&mut child);
    let server = wait_for_pid(dir.path().join("Output/server.pid"));
    assert!(is_alive(server));

    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();
    let status = child.wait().unwrap();

    assert_eq!(status.code(), None);
    assert_eq!(status.signal(), Some(Signal::SIGINT as i32));
    assert!(!is_alive(server));
}

#[test]
fn test_double_interrupt_still_stops_server_once() {
    let dir = site(SERVE_FOREVER);
    let mut child = spawn_interactive(dir.path());

    wait_for_banner(&mut child);
    let server = wait_for_pid(dir.path().join("Output/server.pid"));
    assert!(is_alive(server));

    let preview = Pid::from_raw(child.id() as i32);
    kill(preview, Signal::SIGINT).unwrap();
    // The preview may already be gone by the time the second one lands.
    let _ = kill(preview, Signal::SIGINT);
    let status = child.wait().unwrap();

    assert_eq!(status.code(), None);
    assert_eq!(status.signal(), Some(Signal::SIGINT as i32));
    assert!(!is_alive(server));
}

#[test]
fn test_port_conflict_reports_port_and_exits_one() {
    let dir = site(
        "echo 'Traceback (most recent call last):' >&2; \
         echo 'OSError: [Errno 98] Address already in use' >&2; exit 1",
    );
    let mut child = spawn_interactive(dir.path());
    // Keep stdin open: the failure must end the preview without any input.
    let _stdin = child.stdin.take();

    let mut stderr = String::new();
    child
        .stderr
        .take()
        .unwrap()
        .read_to_string(&mut stderr)
        .unwrap();
    let status = child.wait().unwrap();

    assert_eq!(status.code(), Some(1));
    assert!(stderr.contains("❌ Failed to start local web server"));
    assert!(stderr.contains("8000"));
    assert!(stderr.contains("another preview session"));
    assert!(!stderr.contains("Traceback"));
}

#[test]
fn test_generic_server_failure_shows_raw_error() {
    let dir = site("echo 'fatal: cannot serve this' >&2; exit 2");
    let mut child = spawn_interactive(dir.path());
    let _stdin = child.stdin.take();

    let mut stderr = String::new();
    child
        .stderr
        .take()
        .unwrap()
        .read_to_string(&mut stderr)
        .unwrap();
    let status = child.wait().unwrap();

    assert_eq!(status.code(), Some(1));
    assert!(stderr.contains("fatal: cannot serve this"));
}

#[test]
fn test_missing_output_directory_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), SERVE_FOREVER);

    let output = preview(dir.path())
        .stdin(Stdio::null())
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("Starting web server"));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Output"));
}

#[test]
fn test_port_zero_is_rejected_by_cli() {
    let dir = site(SERVE_FOREVER);
    let output = Command::new(env!("CARGO_BIN_EXE_preview-server"))
        .arg("--root")
        .arg(dir.path())
        .arg("--port")
        .arg("0")
        .stdin(Stdio::null())
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(!dir.path().join("Output/server.pid").exists());
}
