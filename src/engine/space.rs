use crate::library::{PhotoStore, StoreError};
use crate::types::PhotoAsset;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Bytes to MiB, rounded to two decimals (halves away from zero).
pub fn bytes_to_mib_rounded(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_MIB * 100.0).round() / 100.0
}

/// Total size of the paired-video resources of `assets`, which is what
/// replacing them with still copies reclaims.
pub async fn paired_video_bytes(
    store: &dyn PhotoStore,
    assets: &[PhotoAsset],
) -> Result<u64, StoreError> {
    let mut total = 0u64;
    for asset in assets {
        let parts = store.resource_parts(&asset.id).await?;
        total += parts
            .iter()
            .filter(|p| p.kind.is_paired_video())
            .map(|p| p.size)
            .sum::<u64>();
    }
    Ok(total)
}

/// Approximate freed space in MiB.
pub async fn approx_freed_space(
    store: &dyn PhotoStore,
    assets: &[PhotoAsset],
) -> Result<f64, StoreError> {
    let bytes = paired_video_bytes(store, assets).await?;
    tracing::debug!(assets = assets.len(), bytes, "Computed reclaimable size");
    Ok(bytes_to_mib_rounded(bytes))
}
