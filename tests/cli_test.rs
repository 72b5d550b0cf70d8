use std::process::Command;

use tempfile::TempDir;

fn bizwatch(dir: &TempDir) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_bizwatch"));
    cmd.current_dir(dir.path())
        .env("HOSTNAME", "station-7")
        .env_remove("BIZWATCH_CONFIG");
    cmd
}

#[test]
fn test_init_then_check() {
    let temp_dir = TempDir::new().unwrap();
    let data = temp_dir.path().join("data");
    std::fs::create_dir(&data).unwrap();

    let output = bizwatch(&temp_dir).arg("init").output().unwrap();
    assert!(output.status.success());

    let config_path = temp_dir.path().join("conf/bizwatch.toml");
    let content = std::fs::read_to_string(&config_path).unwrap();
    assert!(content.contains(r#"hostname = "station-7""#));
    assert!(content.contains("[watchdog]"));

    // refuses to clobber without --force
    let output = bizwatch(&temp_dir).arg("init").output().unwrap();
    assert!(!output.status.success());
    let output = bizwatch(&temp_dir).args(["init", "--force"]).output().unwrap();
    assert!(output.status.success());

    let biz = format!(
        "\n[biz.t1]\nwatch = {:?}\nconsole = true\n",
        data.to_string_lossy()
    );
    let mut content = std::fs::read_to_string(&config_path).unwrap();
    content.push_str(&biz);
    std::fs::write(&config_path, content).unwrap();

    let output = bizwatch(&temp_dir).arg("check").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("host: station-7"));
    assert!(stdout.contains("[t1]"));
    assert!(stdout.contains("console"));
}

#[test]
fn test_state_count_on_fresh_store() {
    let temp_dir = TempDir::new().unwrap();
    let config = temp_dir.path().join("custom.toml");
    std::fs::write(&config, "[agent]\nhostname = \"station-7\"\n").unwrap();

    let output = bizwatch(&temp_dir)
        .args(["state", "count", "--config"])
        .arg(&config)
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "0");
    assert!(temp_dir.path().join(".bizwatch/state").is_dir());
}

#[cfg(unix)]
#[test]
fn test_sigterm_stops_run_and_flushes_seen_state() {
    use std::time::{Duration, Instant};

    let temp_dir = TempDir::new().unwrap();
    let data = temp_dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    std::fs::write(data.join("old.csv"), "1,2").unwrap();

    let config = temp_dir.path().join("bizwatch.toml");
    std::fs::write(
        &config,
        format!(
            "[agent]\nhostname = \"station-7\"\n\n[watchdog]\nbatch_tick_ms = 20\n\n[biz.t1]\nwatch = {:?}\nrealtime = false\nconsole = true\ndebounce_ms = 50\n",
            data.to_string_lossy()
        ),
    )
    .unwrap();

    let mut child = bizwatch(&temp_dir)
        .arg("run")
        .arg("--config")
        .arg(&config)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();

    // the backfill ships old.csv right away
    std::thread::sleep(Duration::from_secs(2));
    let killed = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(killed.success());

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if started.elapsed() > Duration::from_secs(10) {
            child.kill().unwrap();
            panic!("bizwatch run ignored SIGTERM");
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    assert!(status.success(), "exit status {status}");

    let output = bizwatch(&temp_dir)
        .args(["state", "count", "--config"])
        .arg(&config)
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "1");
}
