//! WGSL kernel sources and tile-size composition.
//!
//! The tile size is the one constant shared by the kernel's internal blocking
//! and the dispatch grid. Kernels never hard-code it: they carry a
//! placeholder line that is replaced with the actual constant before
//! compilation, and the same [`TileSize`] value drives
//! [`dispatch_grid`](crate::gpu::pipeline::dispatch_grid).

/// Line replaced with the `TILE_SIZE` / `TILE_AREA` constants.
pub const TILE_SIZE_PLACEHOLDER: &str = "// TILE_SIZE_DECLARATION";

/// Largest tile whose workgroup (`tile * tile` invocations) fits the default
/// `max_compute_invocations_per_workgroup` of 256.
pub const MAX_TILE_SIZE: u32 = 16;

pub const GEMM_TEMPLATE: &str = include_str!("gemm.wgsl");
pub const NAIVE_MATMUL_TEMPLATE: &str = include_str!("matmul_naive.wgsl");

/// Edge length of the square block each workgroup computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSize(u32);

impl TileSize {
    pub const DEFAULT: TileSize = TileSize(16);

    /// Returns `None` unless `1 <= size <= MAX_TILE_SIZE`.
    pub fn new(size: u32) -> Option<Self> {
        (1..=MAX_TILE_SIZE).contains(&size).then_some(Self(size))
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Default for TileSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Kernel source with the tile constants applied.
#[derive(Debug, Clone)]
pub struct ComposedKernel {
    pub source: String,
    /// False when the source had no placeholder, so its tiling could not be
    /// tied to the dispatch grid.
    pub tile_injected: bool,
}

/// Replaces the placeholder line with the tile constants.
pub fn inject_tile_size(source: &str, tile: TileSize) -> ComposedKernel {
    if !source.contains(TILE_SIZE_PLACEHOLDER) {
        return ComposedKernel {
            source: source.to_string(),
            tile_injected: false,
        };
    }

    let declaration = format!(
        "const TILE_SIZE: u32 = {size}u;\nconst TILE_AREA: u32 = {area}u;",
        size = tile.get(),
        area = tile.get() * tile.get(),
    );
    ComposedKernel {
        source: source.replace(TILE_SIZE_PLACEHOLDER, &declaration),
        tile_injected: true,
    }
}

/// The compiled-in tiled GEMM kernel for `tile`.
pub fn gemm_wgsl(tile: TileSize) -> String {
    inject_tile_size(GEMM_TEMPLATE, tile).source
}

/// The untiled MatMul kernel used by the reference runtime.
pub fn naive_matmul_wgsl(tile: TileSize) -> String {
    inject_tile_size(NAIVE_MATMUL_TEMPLATE, tile).source
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemm_wgsl_declares_tile_constants() {
        let wgsl = gemm_wgsl(TileSize::DEFAULT);
        assert!(wgsl.contains("const TILE_SIZE: u32 = 16u;"));
        assert!(wgsl.contains("const TILE_AREA: u32 = 256u;"));
        assert!(!wgsl.contains(TILE_SIZE_PLACEHOLDER));
        assert!(wgsl.contains("fn main("));
    }

    #[test]
    fn test_tile_size_substitution() {
        let tile = TileSize::new(8).unwrap();
        let wgsl = naive_matmul_wgsl(tile);
        assert!(wgsl.contains("const TILE_SIZE: u32 = 8u;"));
        assert!(wgsl.contains("const TILE_AREA: u32 = 64u;"));
    }

    #[test]
    fn test_source_without_placeholder_is_flagged() {
        let source = "@compute @workgroup_size(16, 16) fn main() {}";
        let composed = inject_tile_size(source, TileSize::DEFAULT);
        assert!(!composed.tile_injected);
        assert!(!composed.source.contains("TILE_SIZE"));
    }

    #[test]
    fn test_tile_size_bounds() {
        assert!(TileSize::new(0).is_none());
        assert!(TileSize::new(17).is_none());
        assert_eq!(TileSize::new(16), Some(TileSize::DEFAULT));
    }
}
