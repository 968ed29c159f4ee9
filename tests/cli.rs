//! Command-line behavior of the manager binary.

use std::process::Command;

fn manager() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_eks-controlplane-manager"));
    // keep the binary off any real cluster
    cmd.env("KUBECONFIG", "/nonexistent/kubeconfig")
        .env_remove("KUBERNETES_SERVICE_HOST");
    cmd
}

#[test]
fn test_help_lists_flags() {
    let output = manager().arg("--help").output().unwrap();
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);

    for flag in [
        "--metrics-bind-addr",
        "--leader-elect",
        "--namespace",
        "--profiler-address",
        "--ekscontrolplane-concurrency",
        "--sync-period",
        "--webhook-port",
        "--webhook-cert-dir",
        "--service-endpoints",
        "--watch-filter",
        "--feature-gates",
        "--health-addr",
    ] {
        assert!(help.contains(flag), "missing flag in help: {}", flag);
    }
}

#[test]
fn test_sync_period_above_ceiling_exits_non_zero() {
    let output = manager()
        .args(["--sync-period=15m", "--log-json"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let logs = String::from_utf8_lossy(&output.stdout);
    assert!(logs.contains("sync period greater than maximum allowed"));
    assert!(logs.contains("\"stage\":\"guard\""));
}

#[test]
fn test_malformed_service_endpoints_exit_non_zero() {
    let output = manager()
        .arg("--service-endpoints=us-east-1")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_unknown_feature_gate_exits_non_zero() {
    let output = manager()
        .arg("--feature-gates=NotAGate=true")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}
