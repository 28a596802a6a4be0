//! End-to-end tests of the HTTP surface with fake stage adapters.

use async_trait::async_trait;
use axum_test::TestServer;
use buildshell_core::{
    Adapters, AttachedTerminal, BuildInvoker, BuildWorkspace, CoreError, Fetcher, ImageBuilder,
    ImageTag, OutputSink, SpecFile, Stage, TerminalAttacher, TerminalSize,
};
use buildshell_server::{http::build_router, BuildShellServer, ServerConfig};
use bytes::Bytes;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct RecipeFetcher {
    dir: PathBuf,
}

#[async_trait]
impl Fetcher for RecipeFetcher {
    async fn fetch(&self, url: &str, _cancel: &CancellationToken) -> buildshell_core::Result<SpecFile> {
        if url.contains("unreachable") {
            return Err(CoreError::Download(format!("error sending request for url ({url})")));
        }
        let file = tempfile::NamedTempFile::new_in(&self.dir)?;
        std::fs::write(file.path(), url)?;
        Ok(SpecFile::from_temp_path(file.into_temp_path(), url))
    }
}

/// Fails recipes whose locator contains `bad`, blocks on `slow`.
struct ScriptedInvoker {
    dir: PathBuf,
}

#[async_trait]
impl BuildInvoker for ScriptedInvoker {
    async fn build(
        &self,
        spec: &SpecFile,
        cancel: &CancellationToken,
        sink: &OutputSink,
    ) -> buildshell_core::Result<BuildWorkspace> {
        let origin = spec.origin();
        if origin.contains("slow") {
            let _ = sink.send_line("started").await;
            cancel.cancelled().await;
            return Err(CoreError::Cancelled {
                stage: Stage::BuildingScript,
            });
        }
        let _ = sink.send_line("resolving recipe").await;
        if origin.contains("bad") {
            return Err(CoreError::Build {
                exit_code: Some(2),
                last_lines: vec!["resolving recipe".into()],
                reason: "exit status 2".into(),
            });
        }
        let dir = tempfile::tempdir_in(&self.dir)?;
        Ok(BuildWorkspace::new(dir))
    }
}

struct NoopImages;

#[async_trait]
impl ImageBuilder for NoopImages {
    async fn build_image(
        &self,
        _context: &Path,
        _tag: &ImageTag,
        _cancel: &CancellationToken,
        sink: &OutputSink,
    ) -> buildshell_core::Result<()> {
        let _ = sink.send_text("Step 1/1\r".to_string()).await;
        Ok(())
    }
}

/// Prints `$ ` and echoes input prefixed with `echo:`.
#[derive(Default)]
struct EchoAttacher {
    sizes: Mutex<Vec<TerminalSize>>,
}

#[async_trait]
impl TerminalAttacher for EchoAttacher {
    async fn attach(
        &self,
        _image: &ImageTag,
        size: TerminalSize,
        _cancel: &CancellationToken,
    ) -> buildshell_core::Result<AttachedTerminal> {
        self.sizes.lock().unwrap().push(size);
        let (out_tx, out_rx) = mpsc::channel::<Bytes>(16);
        let (in_tx, mut in_rx) = mpsc::channel::<Bytes>(16);

        let echo = tokio::spawn(async move {
            if out_tx.send(Bytes::from_static(b"$ ")).await.is_err() {
                return;
            }
            while let Some(bytes) = in_rx.recv().await {
                let echoed = [b"echo:".as_slice(), &bytes[..]].concat();
                if out_tx.send(Bytes::from(echoed)).await.is_err() {
                    break;
                }
            }
        });
        Ok(AttachedTerminal::new(out_rx, in_tx, move || echo.abort()))
    }
}

struct TestApp {
    server: TestServer,
    state: BuildShellServer,
    attacher: Arc<EchoAttacher>,
    _work: TempDir,
}

fn app() -> TestApp {
    let work = tempfile::tempdir().unwrap();
    let mut config = ServerConfig::default();
    config.pipeline.work_root = work.path().to_path_buf();

    let attacher = Arc::new(EchoAttacher::default());
    let adapters = Adapters {
        fetcher: Arc::new(RecipeFetcher {
            dir: work.path().to_path_buf(),
        }),
        invoker: Arc::new(ScriptedInvoker {
            dir: work.path().to_path_buf(),
        }),
        images: Arc::new(NoopImages),
        attacher: attacher.clone(),
    };
    let state = BuildShellServer::with_adapters(&config, adapters);
    let server = TestServer::builder()
        .http_transport()
        .build(build_router(state.clone()))
        .expect("Failed to create test server");

    TestApp {
        server,
        state,
        attacher,
        _work: work,
    }
}

mod http_endpoints {
    use super::*;

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = app();

        let response = app.server.get("/health").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "buildshell-server");
        assert_eq!(body["active_sessions"], 0);
    }

    #[tokio::test]
    async fn test_sessions_empty() {
        let app = app();

        let response = app.server.get("/sessions").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_root_page() {
        let app = app();

        let response = app.server.get("/").await;

        response.assert_status_ok();
        assert!(response.text().contains("/ws?spec="));
    }
}

mod websocket {
    use super::*;

    #[tokio::test]
    async fn test_missing_spec() {
        let app = app();
        let mut ws = app.server.get_websocket("/ws").await.into_websocket().await;

        assert_eq!(ws.receive_text().await, "spec query param required\n");
    }

    #[tokio::test]
    async fn test_download_failure() {
        let app = app();
        let mut ws = app
            .server
            .get_websocket("/ws")
            .add_query_param("spec", "http://unreachable.invalid/r.yaml")
            .await
            .into_websocket()
            .await;

        assert!(ws.receive_text().await.starts_with("download failed:"));
    }

    #[tokio::test]
    async fn test_build_failure_streams_log_then_diagnostic() {
        let app = app();
        let mut ws = app
            .server
            .get_websocket("/ws")
            .add_query_param("spec", "http://recipes.test/bad.yaml")
            .await
            .into_websocket()
            .await;

        assert_eq!(ws.receive_text().await, "resolving recipe\n");
        assert_eq!(ws.receive_text().await, "builder error: exit status 2\n");
    }

    #[tokio::test]
    async fn test_interactive_round_trip() {
        let app = app();
        let mut ws = app
            .server
            .get_websocket("/ws")
            .add_query_param("spec", "http://recipes.test/ok.yaml")
            .add_query_param("cols", "100")
            .add_query_param("rows", "40")
            .await
            .into_websocket()
            .await;

        assert_eq!(ws.receive_text().await, "resolving recipe\n");
        assert_eq!(ws.receive_text().await, "Step 1/1\r");
        assert_eq!(ws.receive_bytes().await, Bytes::from_static(b"$ "));

        // xterm.js sends keystrokes as text messages
        ws.send_text("ls\n").await;
        assert_eq!(ws.receive_bytes().await, Bytes::from_static(b"echo:ls\n"));

        assert_eq!(app.state.sessions().len(), 1);
        assert_eq!(app.state.sessions()[0].stage, Stage::Interactive);
        assert_eq!(
            *app.attacher.sizes.lock().unwrap(),
            vec![TerminalSize { cols: 100, rows: 40 }]
        );
    }

    #[tokio::test]
    async fn test_cancel_byte_during_build() {
        let app = app();
        let mut ws = app
            .server
            .get_websocket("/ws")
            .add_query_param("spec", "http://recipes.test/slow.yaml")
            .await
            .into_websocket()
            .await;

        assert_eq!(ws.receive_text().await, "started\n");
        ws.send_text("\u{3}").await;
        assert_eq!(ws.receive_text().await, "cancelled during building_script\n");
    }

    #[tokio::test]
    async fn test_shutdown_cancels_session() {
        let app = app();
        let mut ws = app
            .server
            .get_websocket("/ws")
            .add_query_param("spec", "http://recipes.test/slow.yaml")
            .await
            .into_websocket()
            .await;

        assert_eq!(ws.receive_text().await, "started\n");
        app.state.shutdown();
        assert_eq!(ws.receive_text().await, "cancelled during building_script\n");
    }
}
