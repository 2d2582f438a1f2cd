// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{
    Config, KillContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    UploadToContainerOptions, WaitContainerOptions,
};
use bollard::service::{HostConfig, HostConfigLogConfig};
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use maplit::hashmap;

use crate::error::RunError;
use crate::timing::Timing;
use crate::{RunOutcome, MAX_OUTPUT_BYTES};

/// Applied to every volume and container the sandbox creates, so operators
/// can enumerate and garbage-collect them out-of-band.
const SANDBOX_LABEL_KEY: &str = "org.01-edu.type";
const SANDBOX_LABEL_VALUE: &str = "test";

const SEED_MOUNT: &str = "/data";
const JAIL_DIR: &str = "/jail";
const STUDENT_MOUNT: &str = "/jail/student";
const WAIT_TIMEOUT: Duration = Duration::from_secs(15);

const PIDS_LIMIT: i64 = 256;
const MEMORY_BYTES: i64 = 500_000_000;
const NANO_CPUS: i64 = 2_000_000_000;
const TMPFS_OPTIONS: &str = "size=100m,noatime,exec,nodev,nosuid,uid=1000,gid=1000,nr_inodes=5k,mode=1700";

fn container_labels() -> HashMap<String, String> {
    hashmap! { SANDBOX_LABEL_KEY.to_string() => SANDBOX_LABEL_VALUE.to_string() }
}

/// Runs one submission end to end: a scratch volume is created, seeded from
/// `tar` via a throwaway container, then a locked-down test container runs
/// `args` against it. The volume is removed on every exit path after it is
/// created, regardless of where in the pipeline a failure occurs.
pub async fn run(
    docker: &Docker,
    image: &str,
    env: &[String],
    args: &[String],
    tar: Vec<u8>,
    timing: &mut Timing<'_>,
) -> Result<RunOutcome, RunError> {
    let volume_name = create_volume(docker).await?;

    let result = run_with_volume(docker, image, env, args, tar, &volume_name, timing).await;

    if let Err(err) = remove_volume(docker, &volume_name).await {
        log::warn!("volume remove: {err}");
    }

    result
}

async fn create_volume(docker: &Docker) -> Result<String, RunError> {
    let labels = hashmap! { SANDBOX_LABEL_KEY => SANDBOX_LABEL_VALUE };
    let volume = docker
        .create_volume(CreateVolumeOptions::<&str> {
            labels,
            ..Default::default()
        })
        .await
        .map_err(|err| RunError::new(format!("failed to create scratch volume: {err}")))?;
    Ok(volume.name)
}

async fn remove_volume(docker: &Docker, name: &str) -> Result<(), String> {
    docker
        .remove_volume(name, None)
        .await
        .map_err(|err| err.to_string())
}

async fn run_with_volume(
    docker: &Docker,
    image: &str,
    env: &[String],
    args: &[String],
    tar: Vec<u8>,
    volume_name: &str,
    timing: &mut Timing<'_>,
) -> Result<RunOutcome, RunError> {
    seed_volume(docker, image, volume_name, tar).await?;
    timing.mark("container copy");

    let container_id = create_test_container(docker, image, env, args, volume_name).await?;
    timing.mark("container creation");

    let result = start_and_wait(docker, &container_id, timing).await;

    if let Err(err) = remove_container(docker, &container_id).await {
        log::warn!("container remove: {err}");
    }

    result
}

/// Creates a throwaway container whose sole job is to host the scratch
/// volume at `/data`, copies the tape archive into it, and removes the
/// container immediately, irrespective of the copy's outcome.
async fn seed_volume(
    docker: &Docker,
    image: &str,
    volume_name: &str,
    tar: Vec<u8>,
) -> Result<(), RunError> {
    let config = Config {
        image: Some(image.to_string()),
        labels: Some(container_labels()),
        host_config: Some(HostConfig {
            binds: Some(vec![format!("{volume_name}:{SEED_MOUNT}")]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let container = docker
        .create_container::<&str, String>(None, config)
        .await
        .map_err(|err| RunError::new(format!("failed to create seed container: {err}")))?;

    let copy_result = docker
        .upload_to_container(
            &container.id,
            Some(UploadToContainerOptions {
                path: SEED_MOUNT,
                copy_uid_gid: true,
                ..Default::default()
            }),
            Bytes::from(tar),
        )
        .await;

    if let Err(err) = remove_container(docker, &container.id).await {
        log::warn!("seed container remove: {err}");
    }

    copy_result.map_err(|err| RunError::new(format!("failed to copy archive into sandbox: {err}")))
}

async fn create_test_container(
    docker: &Docker,
    image: &str,
    env: &[String],
    args: &[String],
    volume_name: &str,
) -> Result<String, RunError> {
    let mut full_env: Vec<String> = env.to_vec();
    full_env.push(format!("HOME={JAIL_DIR}"));
    full_env.push(format!("TMPDIR={JAIL_DIR}"));

    let extra_hosts: Vec<String> = env
        .iter()
        .filter_map(|entry| entry.strip_prefix("DOMAIN="))
        .map(|domain| format!("{domain}:127.0.0.1"))
        .collect();

    let host_config = HostConfig {
        binds: Some(vec![format!("{volume_name}:{STUDENT_MOUNT}:ro")]),
        tmpfs: Some(hashmap! { JAIL_DIR.to_string() => TMPFS_OPTIONS.to_string() }),
        readonly_rootfs: Some(true),
        network_mode: Some("none".to_string()),
        pids_limit: Some(PIDS_LIMIT),
        memory: Some(MEMORY_BYTES),
        nano_cpus: Some(NANO_CPUS),
        extra_hosts: (!extra_hosts.is_empty()).then_some(extra_hosts),
        log_config: Some(HostConfigLogConfig {
            typ: Some("json-file".to_string()),
            config: Some(hashmap! {
                "max-size".to_string() => "1m".to_string(),
                "max-file".to_string() => "2".to_string(),
            }),
        }),
        ..Default::default()
    };

    let config = Config {
        image: Some(image.to_string()),
        user: Some("1000:1000".to_string()),
        working_dir: Some(JAIL_DIR.to_string()),
        env: Some(full_env),
        cmd: Some(args.to_vec()),
        labels: Some(container_labels()),
        host_config: Some(host_config),
        ..Default::default()
    };

    let container = docker
        .create_container::<&str, String>(None, config)
        .await
        .map_err(|err| RunError::new(format!("failed to create test container: {err}")))?;

    Ok(container.id)
}

async fn start_and_wait(
    docker: &Docker,
    container_id: &str,
    timing: &mut Timing<'_>,
) -> Result<RunOutcome, RunError> {
    docker
        .start_container::<String>(container_id, None)
        .await
        .map_err(|err| RunError::new(format!("failed to start test container: {err}")))?;
    timing.mark("container start");

    let mut wait_stream = docker.wait_container(
        container_id,
        Some(WaitContainerOptions {
            condition: "not-running",
        }),
    );

    let ok = match tokio::time::timeout(WAIT_TIMEOUT, wait_stream.next()).await {
        Err(_elapsed) => {
            docker
                .kill_container(
                    container_id,
                    Some(KillContainerOptions { signal: "SIGKILL" }),
                )
                .await
                .map_err(|err| RunError::new(format!("failed to kill timed-out container: {err}")))?;
            return Err(RunError::new(
                "timeout: did you write an infinite loop?".to_string(),
            ));
        }
        Ok(None) => {
            return Err(RunError::new(
                "container wait channel closed unexpectedly".to_string(),
            ));
        }
        Ok(Some(Err(err))) => return Err(RunError::new(format!("container wait failed: {err}"))),
        Ok(Some(Ok(status))) => {
            if let Some(wait_error) = status.error {
                // Divergence from the original source (see DESIGN.md): a
                // non-empty wait error is surfaced as a request failure
                // rather than a process panic.
                return Err(RunError::new(format!(
                    "container wait reported an error: {}",
                    wait_error.message.unwrap_or_default()
                )));
            }
            status.status_code == 0
        }
    };
    timing.mark("container stop");

    let output = collect_output(docker, container_id).await?;
    timing.mark("container logs");

    Ok(RunOutcome { output, ok })
}

/// Retrieves container logs with stdout and stderr both selected, merging
/// them into one buffer in arrival order, and truncates the result if it
/// exceeds the output ceiling.
async fn collect_output(docker: &Docker, container_id: &str) -> Result<Vec<u8>, RunError> {
    let options = LogsOptions::<String> {
        stdout: true,
        stderr: true,
        ..Default::default()
    };
    let mut stream = docker.logs(container_id, Some(options));

    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|err| RunError::new(format!("failed to read container logs: {err}")))?;
        let message = match chunk {
            LogOutput::StdOut { message } | LogOutput::StdErr { message } => message,
            _ => continue,
        };
        buffer.extend_from_slice(&message);
    }

    if buffer.len() > MAX_OUTPUT_BYTES {
        buffer.truncate(MAX_OUTPUT_BYTES);
        buffer.extend_from_slice(b" ... TRUNCATED");
    }
    Ok(buffer)
}

async fn remove_container(docker: &Docker, container_id: &str) -> Result<(), String> {
    docker
        .remove_container(
            container_id,
            Some(RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            }),
        )
        .await
        .map_err(|err| err.to_string())
}
