//! Shared helpers for integration tests.
//!
//! The daemon core only ever talks to its OCI runtime through a
//! runc-shaped CLI, so the tests generate a small shell script that
//! implements that CLI against real host processes: `create` spawns a
//! long sleep as the container process, `kill` signals it and drops an
//! exit file, `state` reports JSON the mediator parses, `exec` runs the
//! command directly. No root, no kernel namespaces needed.

use podbay::container::ContainerMetadata;
use podbay::sandbox::PodSandboxMetadata;
use podbay::{Config, ContainerConfig, RuntimeHandler, SandboxConfig};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Writes the fake runtime script and returns its path.
pub fn write_fake_runtime(dir: &Path, exits_dir: &Path) -> PathBuf {
    let state_dir = dir.join("rt-state");
    std::fs::create_dir_all(&state_dir).unwrap();
    std::fs::create_dir_all(exits_dir).unwrap();

    let script = FAKE_RUNTIME_TEMPLATE
        .replace("__STATE__", &state_dir.display().to_string())
        .replace("__EXITS__", &exits_dir.display().to_string());

    let path = dir.join("fake-runc");
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Daemon configuration pointing at temp roots and the fake runtime.
pub fn test_config(base: &Path) -> Config {
    let mut config = Config::with_roots(base.join("lib"), base.join("run"));
    // No pinns helper and no CRIU on test hosts; the sandboxes live in
    // host namespaces and the fake runtime "checkpoints" by itself.
    config.manage_ns_lifecycle = false;
    config.check_criu = false;
    let runtime = write_fake_runtime(base, &config.exits_dir.clone());
    config.runtimes.insert(
        config.default_runtime.clone(),
        RuntimeHandler { path: runtime },
    );
    config
}

pub fn sandbox_config(name: &str) -> SandboxConfig {
    SandboxConfig {
        metadata: PodSandboxMetadata {
            name: name.to_string(),
            uid: format!("{name}-uid"),
            namespace: "default".to_string(),
            attempt: 0,
        },
        hostname: name.to_string(),
        ..Default::default()
    }
}

pub fn container_config(name: &str, command: &[&str]) -> ContainerConfig {
    ContainerConfig {
        metadata: ContainerMetadata {
            name: name.to_string(),
            attempt: 0,
        },
        image: "docker.io/library/redis:latest".to_string(),
        image_name: "redis".to_string(),
        image_ref: "sha256:4f4fb700ef54".to_string(),
        command: command.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

const FAKE_RUNTIME_TEMPLATE: &str = r#"#!/bin/sh
# Fake runc-shaped OCI runtime used by the integration tests.
STATE_DIR=__STATE__
EXITS_DIR=__EXITS__

# kill -0 reports success for zombies too; a killed container process
# reparented to this sandbox's init can sit zombie for a bit before
# being reaped, so treat zombie state as dead as well.
is_alive() {
  kill -0 "$1" 2>/dev/null || return 1
  case "$(ps -o stat= -p "$1" 2>/dev/null)" in
    Z*) return 1 ;;
    *) return 0 ;;
  esac
}

cmd=$1
shift
case "$cmd" in
create)
  pidfile=""
  while [ $# -gt 1 ]; do
    case "$1" in
      --bundle) shift 2 ;;
      --pid-file) pidfile=$2; shift 2 ;;
      *) shift ;;
    esac
  done
  id=$1
  mkdir -p "$STATE_DIR/$id"
  sleep 3600 </dev/null >/dev/null 2>&1 &
  pid=$!
  echo "$pid" > "$STATE_DIR/$id/pid"
  [ -n "$pidfile" ] && echo "$pid" > "$pidfile"
  echo created > "$STATE_DIR/$id/status"
  ;;
start)
  id=$1
  [ -d "$STATE_DIR/$id" ] || { echo "container does not exist" >&2; exit 1; }
  echo running > "$STATE_DIR/$id/status"
  ;;
state)
  id=$1
  [ -d "$STATE_DIR/$id" ] || { echo "container does not exist" >&2; exit 1; }
  status=$(cat "$STATE_DIR/$id/status")
  pid=$(cat "$STATE_DIR/$id/pid" 2>/dev/null || echo 0)
  if [ "$status" != "stopped" ] && ! kill -0 "$pid" 2>/dev/null; then
    status=stopped
    echo stopped > "$STATE_DIR/$id/status"
  fi
  printf '{"ociVersion":"1.0.2","id":"%s","status":"%s","pid":%s,"bundle":""}\n' \
    "$id" "$status" "$pid"
  ;;
kill)
  id=$1
  sig=$2
  [ -d "$STATE_DIR/$id" ] || { echo "container does not exist" >&2; exit 1; }
  pid=$(cat "$STATE_DIR/$id/pid")
  kill -"$sig" "$pid" 2>/dev/null
  i=0
  while kill -0 "$pid" 2>/dev/null && [ "$i" -lt 50 ]; do
    sleep 0.1
    i=$((i+1))
  done
  if ! kill -0 "$pid" 2>/dev/null; then
    echo stopped > "$STATE_DIR/$id/status"
    echo 0 > "$EXITS_DIR/$id"
  fi
  ;;
delete)
  [ "$1" = "--force" ] && shift
  id=$1
  if [ -d "$STATE_DIR/$id" ]; then
    pid=$(cat "$STATE_DIR/$id/pid" 2>/dev/null)
    [ -n "$pid" ] && kill -9 "$pid" 2>/dev/null
    rm -rf "$STATE_DIR/$id"
  else
    echo "container does not exist" >&2
    exit 1
  fi
  ;;
pause)
  id=$1
  echo paused > "$STATE_DIR/$id/status"
  ;;
resume)
  id=$1
  echo running > "$STATE_DIR/$id/status"
  ;;
update)
  exit 0
  ;;
exec)
  id=$1
  shift
  exec "$@"
  ;;
checkpoint)
  image=""
  while [ $# -gt 1 ]; do
    case "$1" in
      --image-path) image=$2; shift 2 ;;
      *) shift ;;
    esac
  done
  id=$1
  [ -d "$STATE_DIR/$id" ] || { echo "container does not exist" >&2; exit 1; }
  mkdir -p "$image"
  echo pages > "$image/pages-1.img"
  ;;
restore)
  image=""
  pidfile=""
  while [ $# -gt 1 ]; do
    case "$1" in
      --image-path) image=$2; shift 2 ;;
      --pid-file) pidfile=$2; shift 2 ;;
      --bundle) shift 2 ;;
      *) shift ;;
    esac
  done
  id=$1
  [ -f "$image/pages-1.img" ] || { echo "no checkpoint image" >&2; exit 1; }
  mkdir -p "$STATE_DIR/$id"
  sleep 3600 </dev/null >/dev/null 2>&1 &
  pid=$!
  echo "$pid" > "$STATE_DIR/$id/pid"
  [ -n "$pidfile" ] && echo "$pid" > "$pidfile"
  echo running > "$STATE_DIR/$id/status"
  ;;
*)
  echo "unknown command $cmd" >&2
  exit 1
  ;;
esac
"#;
