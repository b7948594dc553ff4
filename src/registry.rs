//! Registry fetcher.
//!
//! Pulls the manifest, the image config blob and the layer blobs for a
//! reference. Multi-architecture indexes are resolved against the host
//! platform. Every network operation is bounded by a timeout; transient
//! failures are retried with exponential backoff up to a fixed attempt
//! count. Layer blobs are verified against their manifest digest before
//! being written to the staging directory.
//!
//! The rest of the launcher is synchronous; the async client is confined to
//! this module behind a current-thread runtime.

use std::fs;
use std::path::{Path, PathBuf};

use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::constants::{
    IMAGE_PULL_ATTEMPTS, IMAGE_PULL_BACKOFF_BASE, IMAGE_PULL_TIMEOUT, MAX_CONFIG_SIZE,
    MAX_LAYERS, MAX_LAYER_SIZE, MAX_MANIFEST_SIZE,
};
use crate::error::{Error, Result};
use crate::image::OciImageConfig;
use crate::platform::Platform;
use crate::reference::ImageReference;

/// The result of fetching an image: layer blobs on disk, in manifest order,
/// plus the parsed image config.
pub struct FetchedImage {
    pub layer_paths: Vec<PathBuf>,
    pub config: OciImageConfig,
    pub manifest_digest: String,
}

/// Fetches manifest, config and layers for `reference` into `staging`.
pub fn fetch(
    reference: &ImageReference,
    credentials: Option<&(String, String)>,
    staging: &Path,
) -> Result<FetchedImage> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::ImagePullFailed {
            reference: reference.canonical(),
            reason: format!("failed to start pull runtime: {}", e),
        })?;
    runtime.block_on(fetch_async(reference, credentials, staging))
}

async fn fetch_async(
    reference: &ImageReference,
    credentials: Option<&(String, String)>,
    staging: &Path,
) -> Result<FetchedImage> {
    let registry_ref: Reference =
        reference
            .registry_form()
            .parse()
            .map_err(|e| Error::InvalidImageReference {
                reference: reference.canonical(),
                reason: format!("{}", e),
            })?;

    let client = Client::new(ClientConfig {
        protocol: ClientProtocol::Https,
        ..Default::default()
    });
    let auth = match credentials {
        Some((user, password)) => RegistryAuth::Basic(user.clone(), password.clone()),
        None => RegistryAuth::Anonymous,
    };

    info!("pulling {}", reference.canonical());

    let (manifest, manifest_digest) =
        pull_manifest_with_retry(&client, &registry_ref, &auth, reference).await?;
    let image_manifest =
        resolve_manifest(&client, &registry_ref, &auth, manifest, reference).await?;

    if image_manifest.layers.len() > MAX_LAYERS {
        return Err(Error::ImagePullFailed {
            reference: reference.canonical(),
            reason: format!(
                "too many layers: {} > {}",
                image_manifest.layers.len(),
                MAX_LAYERS
            ),
        });
    }
    let config_size = image_manifest.config.size as usize;
    if config_size > MAX_CONFIG_SIZE {
        return Err(Error::ImageTooLarge {
            size: config_size as u64,
            limit: MAX_CONFIG_SIZE as u64,
        });
    }

    let blob_dir = staging.join("blobs");
    fs::create_dir_all(&blob_dir).map_err(|e| Error::io_path(&blob_dir, e))?;

    let config_raw = pull_blob_with_retry(
        &client,
        &registry_ref,
        &image_manifest.config,
        reference,
    )
    .await?;
    let config = OciImageConfig::from_json(&config_raw)?;

    // Layers are pulled one at a time; the gap between iterations is the
    // pull path's cancellation point.
    let mut layer_paths = Vec::with_capacity(image_manifest.layers.len());
    for layer in &image_manifest.layers {
        if layer.size > MAX_LAYER_SIZE as i64 {
            return Err(Error::ImageTooLarge {
                size: layer.size as u64,
                limit: MAX_LAYER_SIZE as u64,
            });
        }
        debug!("pulling layer {} ({} bytes)", layer.digest, layer.size);
        let data = pull_blob_with_retry(&client, &registry_ref, layer, reference).await?;
        verify_digest(&layer.digest, &data, reference)?;

        let file_name = layer.digest.replace(':', "-");
        let path = blob_dir.join(file_name);
        fs::write(&path, &data).map_err(|e| Error::io_path(&path, e))?;
        layer_paths.push(path);
    }

    Ok(FetchedImage {
        layer_paths,
        config,
        manifest_digest,
    })
}

async fn pull_manifest_with_retry(
    client: &Client,
    registry_ref: &Reference,
    auth: &RegistryAuth,
    reference: &ImageReference,
) -> Result<(oci_distribution::manifest::OciManifest, String)> {
    let mut last_error = String::new();
    for attempt in 0..IMAGE_PULL_ATTEMPTS {
        if attempt > 0 {
            let delay = IMAGE_PULL_BACKOFF_BASE * 2u32.pow(attempt - 1);
            warn!(
                "retrying manifest pull for {} in {:?} ({})",
                reference.canonical(),
                delay,
                last_error
            );
            tokio::time::sleep(delay).await;
        }
        let result = tokio::time::timeout(
            IMAGE_PULL_TIMEOUT,
            client.pull_manifest(registry_ref, auth),
        )
        .await;
        match result {
            Err(_) => {
                last_error = format!("timed out after {:?}", IMAGE_PULL_TIMEOUT);
            }
            Ok(Err(e)) => {
                last_error = e.to_string();
            }
            Ok(Ok(pulled)) => return Ok(pulled),
        }
    }
    Err(Error::ImagePullFailed {
        reference: reference.canonical(),
        reason: last_error,
    })
}

async fn pull_blob_with_retry(
    client: &Client,
    registry_ref: &Reference,
    descriptor: &oci_distribution::manifest::OciDescriptor,
    reference: &ImageReference,
) -> Result<Vec<u8>> {
    let mut last_error = String::new();
    for attempt in 0..IMAGE_PULL_ATTEMPTS {
        if attempt > 0 {
            let delay = IMAGE_PULL_BACKOFF_BASE * 2u32.pow(attempt - 1);
            warn!(
                "retrying blob {} in {:?} ({})",
                descriptor.digest, delay, last_error
            );
            tokio::time::sleep(delay).await;
        }
        let mut data = Vec::new();
        let result = tokio::time::timeout(
            IMAGE_PULL_TIMEOUT,
            client.pull_blob(registry_ref, descriptor, &mut data),
        )
        .await;
        match result {
            Err(_) => {
                last_error = format!("timed out after {:?}", IMAGE_PULL_TIMEOUT);
            }
            Ok(Err(e)) => {
                last_error = e.to_string();
            }
            Ok(Ok(())) => return Ok(data),
        }
    }
    Err(Error::ImagePullFailed {
        reference: reference.canonical(),
        reason: format!("blob {}: {}", descriptor.digest, last_error),
    })
}

/// Resolves a manifest, following a multi-arch index to the entry matching
/// the host platform.
async fn resolve_manifest(
    client: &Client,
    registry_ref: &Reference,
    auth: &RegistryAuth,
    manifest: oci_distribution::manifest::OciManifest,
    reference: &ImageReference,
) -> Result<oci_distribution::manifest::OciImageManifest> {
    match manifest {
        oci_distribution::manifest::OciManifest::Image(image) => Ok(image),
        oci_distribution::manifest::OciManifest::ImageIndex(index) => {
            let platform = Platform::detect();
            let target_os = platform.oci_os();
            let target_arch = platform.oci_arch();

            let matching = index.manifests.iter().find(|m| {
                m.platform
                    .as_ref()
                    .is_some_and(|p| p.os == target_os && p.architecture == target_arch)
            });
            let descriptor = matching.ok_or_else(|| {
                let available: Vec<String> = index
                    .manifests
                    .iter()
                    .filter_map(|m| m.platform.as_ref())
                    .map(|p| format!("{}/{}", p.os, p.architecture))
                    .collect();
                Error::ImagePullFailed {
                    reference: reference.canonical(),
                    reason: format!(
                        "no manifest for {}/{}; available: {}",
                        target_os,
                        target_arch,
                        available.join(", ")
                    ),
                }
            })?;

            if descriptor.size as usize > MAX_MANIFEST_SIZE {
                return Err(Error::ImageTooLarge {
                    size: descriptor.size as u64,
                    limit: MAX_MANIFEST_SIZE as u64,
                });
            }

            let digest_ref: Reference = format!(
                "{}/{}@{}",
                registry_ref.registry(),
                registry_ref.repository(),
                descriptor.digest
            )
            .parse()
            .map_err(|e| Error::ImagePullFailed {
                reference: reference.canonical(),
                reason: format!("failed to build digest reference: {}", e),
            })?;

            let (platform_manifest, _) =
                pull_manifest_with_retry(client, &digest_ref, auth, reference).await?;
            match platform_manifest {
                oci_distribution::manifest::OciManifest::Image(image) => Ok(image),
                _ => Err(Error::ImagePullFailed {
                    reference: reference.canonical(),
                    reason: "nested image index not supported".to_string(),
                }),
            }
        }
    }
}

/// Verifies a blob against its manifest digest before it touches the stage.
fn verify_digest(digest: &str, data: &[u8], reference: &ImageReference) -> Result<()> {
    let expected = match digest.split_once(':') {
        Some(("sha256", hash)) => hash,
        _ => {
            return Err(Error::ImagePullFailed {
                reference: reference.canonical(),
                reason: format!("unsupported digest algorithm in {}", digest),
            });
        }
    };
    let computed = hex::encode(Sha256::digest(data));
    if computed != expected {
        return Err(Error::ImagePullFailed {
            reference: reference.canonical(),
            reason: format!("digest mismatch: expected {}, computed {}", expected, computed),
        });
    }
    Ok(())
}
