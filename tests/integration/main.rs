//! Integration tests for Corral

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn corral(config_dir: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("corral");
        cmd.env("CORRAL_CONFIG", config_dir.path().join("config.toml"));
        cmd
    }

    #[test]
    fn help_displays() {
        let temp = TempDir::new().unwrap();
        corral(&temp)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Single-flight cache"));
    }

    #[test]
    fn version_displays() {
        let temp = TempDir::new().unwrap();
        corral(&temp)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("corral"));
    }

    #[test]
    fn status_runs() {
        // Podman may be missing; status reports that but should not panic
        let temp = TempDir::new().unwrap();
        corral(&temp)
            .arg("status")
            .assert()
            .stdout(predicate::str::contains("Corral System Status"));
    }

    #[test]
    fn config_path_honors_override() {
        let temp = TempDir::new().unwrap();
        corral(&temp)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains(
                temp.path().join("config.toml").display().to_string(),
            ));
    }

    #[test]
    fn config_show_defaults() {
        let temp = TempDir::new().unwrap();
        corral(&temp)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("detach_grace_ms = 10000"));
    }

    #[test]
    fn config_set_persists() {
        let temp = TempDir::new().unwrap();
        corral(&temp)
            .args(["config", "set", "services.detach_grace_ms", "250"])
            .assert()
            .success();

        corral(&temp)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("detach_grace_ms = 250"));
    }

    #[test]
    fn config_set_unknown_key() {
        let temp = TempDir::new().unwrap();
        corral(&temp)
            .args(["config", "set", "vm.name", "x"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown config key"));
    }

    #[test]
    fn invalid_backend_is_reported() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("config.toml"), "[runtime]\nbackend = \"docker\"\n").unwrap();
        fs::write(temp.path().join("corral.toml"), "[services.db]\nimage = \"postgres\"\n").unwrap();

        corral(&temp)
            .args(["up", "-f"])
            .arg(temp.path().join("corral.toml"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unsupported runtime backend: docker"));
    }

    #[test]
    fn digest_stdin_is_key_order_independent() {
        let temp = TempDir::new().unwrap();
        let a = corral(&temp)
            .arg("digest")
            .write_stdin(r#"{"image": "postgres", "ports": [5432]}"#)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let b = corral(&temp)
            .arg("digest")
            .write_stdin(r#"{"ports": [5432], "image": "postgres"}"#)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();

        assert_eq!(a, b);
        assert!(String::from_utf8_lossy(&a).starts_with("sha256:"));
    }

    #[test]
    fn digest_toml_file_matches_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("doc.toml");
        fs::write(&path, "name = \"db\"\nport = 5432\n").unwrap();

        let from_toml = corral(&temp)
            .args(["digest", "--short"])
            .arg(&path)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let from_json = corral(&temp)
            .args(["digest", "--short", "--format", "json"])
            .write_stdin(r#"{"port": 5432, "name": "db"}"#)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();

        assert_eq!(from_toml, from_json);
        assert_eq!(String::from_utf8_lossy(&from_toml).trim().len(), 12);
    }

    #[test]
    fn digest_missing_file() {
        let temp = TempDir::new().unwrap();
        corral(&temp)
            .args(["digest", "/nonexistent/doc.json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Path not found"));
    }

    #[test]
    fn run_missing_stack() {
        let temp = TempDir::new().unwrap();
        corral(&temp)
            .args(["run", "-f", "/nonexistent/corral.toml", "--", "true"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Path not found"));
    }

    #[cfg(unix)]
    #[test]
    fn run_with_host_process_services() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("config.toml"),
            "[runtime]\nbackend = \"process\"\n",
        )
        .unwrap();
        let stack = temp.path().join("corral.toml");
        fs::write(
            &stack,
            "[services.sleeper]\nargs = [\"sleep\", \"30\"]\naliases = [\"idle\"]\n",
        )
        .unwrap();

        corral(&temp)
            .args(["run", "-f"])
            .arg(&stack)
            .args([
                "--",
                "sh",
                "-c",
                "test -n \"$CORRAL_HOSTNAME_ALIAS_sleeper\" && test \"$CORRAL_HOSTNAME_ALIAS_sleeper\" = \"$CORRAL_HOSTNAME_ALIAS_idle\"",
            ])
            .assert()
            .success();
    }

    #[cfg(unix)]
    #[test]
    fn run_propagates_exit_code() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("config.toml"),
            "[runtime]\nbackend = \"process\"\n",
        )
        .unwrap();
        let stack = temp.path().join("corral.toml");
        fs::write(&stack, "[services.sleeper]\nargs = [\"sleep\", \"30\"]\n").unwrap();

        corral(&temp)
            .args(["run", "-f"])
            .arg(&stack)
            .args(["--", "sh", "-c", "exit 7"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("exited with code 7"));
    }
}

mod registry_tests {
    use corral::cache::KeyedCache;
    use corral::digest::{digest, ContentDigest};
    use corral::orchestration::MockRuntime;
    use corral::service::{
        ClientId, Port, RegistrySettings, ServiceBinding, ServiceBindings, ServiceIdentity,
        ServiceRegistry, ServiceSpec, ServiceState,
    };
    use corral::stack::Stack;
    use corral::CorralError;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn registry(runtime: Arc<MockRuntime>, grace_ms: u64) -> ServiceRegistry {
        let settings = RegistrySettings {
            detach_grace: Duration::from_millis(grace_ms),
            ..RegistrySettings::default()
        };
        ServiceRegistry::new(runtime, settings)
    }

    #[tokio::test]
    async fn concurrent_cache_callers_share_one_computation() {
        let cache: Arc<KeyedCache<String>> = Arc::new(KeyedCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let key: ContentDigest = digest("shared-key").unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    let cancel = CancellationToken::new();
                    cache
                        .get_or_initialize(&key, &cancel, || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            Ok("built".to_string())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "built");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stack_dependencies_start_once_and_stop_after_grace() {
        let stack = Stack::parse(
            r#"
            [services.db]
            image = "postgres:16"

            [services.api]
            image = "acme/api"
            depends_on = ["db"]
            "#,
            Path::new("corral.toml"),
        )
        .unwrap();
        let bindings = stack.bindings().unwrap();

        let runtime = Arc::new(MockRuntime::with_start_delay(Duration::from_millis(10)));
        let registry = registry(runtime.clone(), 30);
        let cancel = CancellationToken::new();

        let binding = registry
            .bind(ClientId::new(), &bindings, &cancel)
            .await
            .unwrap();
        assert_eq!(runtime.starts(), 2);
        assert_eq!(registry.records().len(), 2);

        // api's dependency env points at db
        let api_spec = runtime
            .started_specs()
            .into_iter()
            .find(|spec| spec.image.as_deref() == Some("acme/api"))
            .unwrap();
        assert!(api_spec.env.contains_key("CORRAL_HOSTNAME_ALIAS_db"));

        binding.release();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(registry.records().is_empty());
        assert_eq!(runtime.running(), 0);
    }

    #[tokio::test]
    async fn parallel_starts_share_one_instance() {
        let runtime = Arc::new(MockRuntime::with_start_delay(Duration::from_millis(30)));
        let registry = registry(runtime.clone(), 1_000);
        // The mock runtime dials loopback; answer on an ephemeral port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let spec = ServiceSpec::new("redis", ["redis-server"]).with_port(Port::tcp(port));
        let identity = ServiceIdentity::new(spec.hostname().unwrap(), ClientId::new()).unwrap();
        let cancel = CancellationToken::new();

        let (a, b, c) = tokio::join!(
            registry.start(&identity, &spec, &cancel),
            registry.start(&identity, &spec, &cancel),
            registry.start(&identity, &spec, &cancel)
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(runtime.starts(), 1);
        assert_eq!(a.process(), b.process());
        assert_eq!(b.process(), c.process());
        assert_eq!(registry.binding_count(&identity), 3);
        assert_eq!(registry.state(&identity), Some(ServiceState::Running));

        registry.shutdown().await.unwrap();
        assert_eq!(registry.state(&identity), None);
    }

    #[tokio::test]
    async fn failed_dependency_is_reported_with_aliases() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_next_starts(1);
        let registry = registry(runtime.clone(), 10);

        let bindings: ServiceBindings = [ServiceBinding::new(
            ServiceSpec::new("postgres", ["postgres"]).shared(),
        )
        .unwrap()
        .with_alias("db")]
        .into_iter()
        .collect();

        let err = registry
            .bind(ClientId::new(), &bindings, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            CorralError::ServiceStart {
                ref aliases,
                ref source,
                ..
            } => {
                assert!(aliases.contains("db"));
                assert!(matches!(
                    **source,
                    CorralError::ServiceLaunch { phase: "start", .. }
                ));
            }
            ref other => panic!("unexpected error: {}", other),
        }
        assert!(matches!(err.root_cause(), CorralError::ContainerStart(_)));
        assert!(registry.records().is_empty());
    }
}
