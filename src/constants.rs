// src/constants.rs

/// Defaults for the activation-topology pipeline.
pub mod tda {
    /// Hard cap on the point cloud fed to the Rips filtration.
    pub const DEFAULT_MAX_POINTS: usize = 512;

    /// Target dimensionality of the projected cloud.
    pub const PROJECTION_DIMS: usize = 3;

    /// Highest homological dimension reported.
    pub const MAX_HOMOLOGY_DIM: usize = 1;

    /// Cap on the visualization cloud attached to a result.
    pub const VIS_POINT_CAP: usize = 256;

    /// Cluster count for the coarse topology graph.
    pub const DEFAULT_GRAPH_CLUSTERS: usize = 8;

    /// Iteration cap for the k-means pass.
    pub const KMEANS_MAX_ITER: usize = 100;

    /// Percentile of center-to-centroid distances used as the edge cutoff.
    pub const EDGE_PERCENTILE: f32 = 75.0;
}

/// Fusion constants. The reference scale and the blend weight are
/// calibration values; re-tuning candidates, but fixed so old telemetry
/// replays score identically.
pub mod signals {
    /// Persistence entropy is normalized against this reference scale.
    pub const ENTROPY_REFERENCE_SCALE: f32 = 3.0;

    /// Weight of the harmony-key distance folded into dissonance.
    pub const HARMONY_BLEND_WEIGHT: f32 = 0.5;

    /// Health never drops below this unless reconfigured.
    pub const DEFAULT_HEALTH_FLOOR: f32 = 0.2;

    /// Entropy/dissonance mix inside the health score.
    pub const HEALTH_ENTROPY_WEIGHT: f32 = 0.6;
    pub const HEALTH_DISSONANCE_WEIGHT: f32 = 0.4;
}

/// Defaults for the capture probe.
pub mod capture {
    /// Layers tapped when none are configured; negatives count from the top.
    pub const DEFAULT_TAP_LAYERS: [i64; 4] = [-1, -2, -3, -4];

    pub const DEFAULT_MAX_NEW_TOKENS: usize = 32;
    pub const DEFAULT_MAX_INPUT_TOKENS: usize = 512;
    pub const DEFAULT_CAPTURE_TOKENS: usize = 32;
}

/// Default filenames for the system.
pub mod filenames {
    pub const DEFAULT_TELEMETRY_FILE: &str = "data/telemetry/events.jsonl";
    pub const DEFAULT_ONTOLOGY_FILE: &str = "config/concepts.toml";
    pub const DEFAULT_CONFIG_FILE: &str = "config/mindchord.toml";
}
