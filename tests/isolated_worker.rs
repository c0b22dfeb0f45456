#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use twilio_run::config::ServerConfig;
use twilio_run::dispatch::{CachedLoader, Dispatcher, ProgramLoader, RESOURCE_NOT_FOUND, ReloadPolicy};
use twilio_run::http::{Request, StatusCode};
use twilio_run::server::{App, RuntimeState};
use twilio_run::worker::{IsolatedRunner, WORKER_SUBCOMMAND, WorkerCommand};

const YAY: &str = "#!/bin/sh\ncat > /dev/null\necho '{\"ok\":{\"type\":\"text\",\"value\":\"Yay\"}}'\n";
const ECHO_PATH: &str = "#!/bin/sh\nread -r input\necho \"working\"\necho \"$input\" | sed 's/.*\"PATH\":\"\\([^\"]*\\)\".*/{\"ok\":{\"type\":\"text\",\"value\":\"\\1\"}}/'\n";
const FAILS: &str = r#"#!/bin/sh
cat > /dev/null
printf '%s\n' '{"err":{"name":"Error","message":"nope","stack":"Error: nope\n   0: twilio_run::dispatch::invoke\n   1: my_project::fails\n   2: tokio::runtime::poll"}}'
"#;
const GLOBALS: &str = r#"#!/bin/sh
read -r input
case "$input" in
  *'"globals":{'*'"functions":{'*'"yay":{"path":"'*'/functions/yay.sh"'*)
    echo '{"ok":{"type":"text","value":"globals present"}}' ;;
  *)
    echo '{"err":{"name":"Error","message":"no globals in input"}}' ;;
esac
"#;
const CRASHES: &str = "#!/bin/sh\ncat > /dev/null\nexit 3\n";

fn write_program(dir: &Path, name: &str, script: &str) {
    let path = dir.join("functions").join(name);
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("functions")).unwrap();
    write_program(dir.path(), "yay.sh", YAY);
    write_program(dir.path(), "echo-path.sh", ECHO_PATH);
    write_program(dir.path(), "fails.sh", FAILS);
    write_program(dir.path(), "crashes.sh", CRASHES);
    write_program(dir.path(), "globals.sh", GLOBALS);
    dir
}

fn app(dir: &Path, fork_process: bool) -> App {
    let mut config = ServerConfig::new(dir, "http://localhost:3000");
    config.logs = false;
    config.fork_process = fork_process;
    config.discover_routes().unwrap();

    let loader = Arc::new(CachedLoader::new(
        Arc::new(ProgramLoader::new(dir)),
        ReloadPolicy::Live,
    ));
    let runner = IsolatedRunner::new(WorkerCommand::new(
        env!("CARGO_BIN_EXE_twilio-run"),
        [
            WORKER_SUBCOMMAND.to_owned(),
            "--dir".to_owned(),
            dir.display().to_string(),
        ],
    ));
    let state = Arc::new(RuntimeState::new(config).unwrap());
    App::new(state, Dispatcher::new(loader), runner)
}

fn get(path: &str) -> Request {
    let raw = format!("GET {path} HTTP/1.1\r\nUser-Agent: test\r\n\r\n");
    Request::parse(raw.as_bytes()).unwrap().0
}

#[tokio::test]
async fn forked_and_in_process_replies_match() {
    let dir = project();
    for fork_process in [true, false] {
        let response = app(dir.path(), fork_process).handle(get("/yay")).await;
        assert_eq!(response.status(), StatusCode::OK, "fork_process={fork_process}");
        assert_eq!(response.headers().get("content-type"), Some("text/plain"));
        assert_eq!(response.body_text(), "Yay");
    }
}

#[tokio::test]
async fn program_sees_injected_context() {
    let dir = project();
    for fork_process in [true, false] {
        let response = app(dir.path(), fork_process).handle(get("/echo-path")).await;
        assert_eq!(response.status(), StatusCode::OK, "fork_process={fork_process}");
        assert_eq!(response.body_text(), "/echo-path");
    }
}

#[tokio::test]
async fn program_receives_global_scope() {
    let dir = project();
    for fork_process in [true, false] {
        let response = app(dir.path(), fork_process).handle(get("/globals")).await;
        assert_eq!(response.status(), StatusCode::OK, "fork_process={fork_process}: {}", response.body_text());
        assert_eq!(response.body_text(), "globals present");
    }
}

#[tokio::test]
async fn worker_errors_are_500() {
    let dir = project();
    let app = app(dir.path(), true);

    let response = app.handle(get("/fails")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_str(&response.body_text()).unwrap();
    assert_eq!(body["message"], "nope");
    assert_eq!(body["stack"], "Error: nope\n   1: my_project::fails");

    let response = app.handle(get("/crashes")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_str(&response.body_text()).unwrap();
    assert_eq!(body["name"], "ProgramError");
}

#[tokio::test]
async fn missing_function_file_is_404_before_forking() {
    let dir = project();
    let app = app(dir.path(), true);
    fs::remove_file(dir.path().join("functions/yay.sh")).unwrap();

    let response = app.handle(get("/yay")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.body_text(), RESOURCE_NOT_FOUND);
}
