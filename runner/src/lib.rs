// Licensed under the Apache License, Version 2.0 (see LICENSE).
//! Sandboxed code-execution pipeline: archive ingestion, archive format
//! conversion, image freshness management, and sandbox container lifecycle.
//!
//! This crate implements the core described in the system's design: it does
//! not speak HTTP itself, leaving transport, argument parsing, and the
//! container runtime's wire protocol to its caller and to [`bollard`].

pub mod archive;
pub mod error;
pub mod freshness;
pub mod identity;
pub mod sandbox;
pub mod timing;

pub use error::RunError;
pub use freshness::FreshnessCache;
pub use identity::IdentityTracker;

use bollard::Docker;

use crate::timing::Timing;

/// The default maximum HTTP header size, reused both as the request-body
/// ceiling and as the captured-output truncation ceiling.
pub const MAX_OUTPUT_BYTES: usize = 1 << 20;

/// Caller-supplied parameters for one code-execution request.
pub struct ExecutionRequest {
    pub image: String,
    pub env: Vec<String>,
    pub args: Vec<String>,
    pub body: Vec<u8>,
}

/// Outcome of a request that made it through the whole pipeline without
/// erroring. `ok` reflects the test container's exit status, not whether the
/// pipeline itself succeeded.
pub struct RunOutcome {
    pub output: Vec<u8>,
    pub ok: bool,
}

/// Runs the full pipeline for one request: transcode the archive, refresh the
/// image, then execute it in a sandbox. `request_id` is used only for timing
/// log correlation.
pub async fn run_request(
    docker: &Docker,
    freshness: &FreshnessCache,
    registry_password: Option<&str>,
    request_id: &str,
    req: ExecutionRequest,
) -> Result<RunOutcome, RunError> {
    let mut timing = Timing::start(request_id);

    let tar = archive::zip_to_tar(&req.body)?;
    timing.mark("zip to tar");

    freshness.ensure(docker, &req.image, registry_password).await?;
    timing.mark(&format!("image pulled: {}", req.image));

    sandbox::run(docker, &req.image, &req.env, &req.args, tar, &mut timing).await
}
