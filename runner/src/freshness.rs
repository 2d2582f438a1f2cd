// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashMap;
use std::time::{Duration, Instant};

use bollard::auth::DockerCredentials;
use bollard::image::CreateImageOptions;
use bollard::service::CreateImageInfo;
use bollard::Docker;
use futures::StreamExt;

use crate::error::RunError;

const FRESHNESS_WINDOW: Duration = Duration::from_secs(60);
const PRIVATE_REGISTRY_PREFIX: &str = "docker.01-edu.org/";
const REGISTRY_USERNAME: &str = "root";

/// Rate-limits image pulls to at most one per image per minute, serialising
/// concurrent requests for the same image behind a single pull attempt.
///
/// The lock is held across the network call on purpose: the invariant is "at
/// most one pull per image per minute", not "minimum time under lock". This
/// trades contention on a single hot image for simplicity; it is acceptable
/// because pulls are infrequent and contention across distinct images never
/// occurs (each image gets its own map entry, but they all share the lock).
#[derive(Default)]
pub struct FreshnessCache {
    last_refresh: tokio::sync::Mutex<HashMap<String, Instant>>,
}

impl FreshnessCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures `image` has been refreshed within the freshness window,
    /// tolerating a pull failure when a local copy of the image can still be
    /// inspected.
    pub async fn ensure(
        &self,
        docker: &Docker,
        image: &str,
        registry_password: Option<&str>,
    ) -> Result<(), RunError> {
        let mut last_refresh = self.last_refresh.lock().await;

        let needs_refresh = last_refresh
            .get(image)
            .map(|at| at.elapsed() >= FRESHNESS_WINDOW)
            .unwrap_or(true);

        if needs_refresh {
            if let Err(err) = pull_image(docker, image, registry_password).await {
                log::warn!("pull {image} failed: {err}");
                // Tolerated iff a local copy exists; the freshness timestamp is
                // still bumped so a persistent outage costs at most one inspect
                // per minute rather than one per request.
                docker
                    .inspect_image(image)
                    .await
                    .map_err(|_| RunError::new(err))?;
            }
            last_refresh.insert(image.to_string(), Instant::now());
        }

        Ok(())
    }
}

async fn pull_image(
    docker: &Docker,
    image: &str,
    registry_password: Option<&str>,
) -> Result<(), String> {
    let credentials = if image.starts_with(PRIVATE_REGISTRY_PREFIX) {
        Some(DockerCredentials {
            username: Some(REGISTRY_USERNAME.to_string()),
            password: registry_password.map(str::to_string),
            ..Default::default()
        })
    } else {
        None
    };

    let options = CreateImageOptions::<&str> {
        from_image: image,
        ..Default::default()
    };

    let mut stream = docker.create_image(Some(options), None, credentials);
    while let Some(message) = stream.next().await {
        match message {
            Ok(CreateImageInfo {
                error: Some(error), ..
            }) => return Err(error),
            Ok(_) => {}
            Err(err) => return Err(err.to_string()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_registry_prefix_matches_spec_host() {
        assert!("docker.01-edu.org/grading/base".starts_with(PRIVATE_REGISTRY_PREFIX));
        assert!(!"docker.io/library/alpine".starts_with(PRIVATE_REGISTRY_PREFIX));
    }
}
