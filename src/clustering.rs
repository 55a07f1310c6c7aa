//! Default people clusterer: average-linkage agglomerative clustering over
//! cosine distances, cut at a fixed distance.

use std::collections::HashMap;

use async_trait::async_trait;
use kodama::{Method, linkage};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::{
    config::SyncConfig,
    error::{Error, Result},
    people::FaceClusterer,
    types::{ClusteringResults, FaceEmbedding, LibraryMlData},
};

pub const METHOD: &str = "hierarchical-average-cosine";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HierarchicalClusterer {
    /// Largest average cosine distance at which two groups still merge.
    pub max_distance: f32,
    /// Groups smaller than this are reported as noise.
    pub min_cluster_size: usize,
}

impl HierarchicalClusterer {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_distance: config.cluster_max_distance,
            min_cluster_size: config.min_cluster_size,
        }
    }

    /// Cluster synchronously; [`FaceClusterer::cluster`] runs this on the
    /// blocking pool.
    pub fn cluster_blocking(
        &self,
        faces: &[FaceEmbedding],
    ) -> ClusteringResults {
        let Some(dim) = dominant_dimension(faces) else {
            return ClusteringResults::default();
        };

        let (usable, mismatched): (Vec<_>, Vec<_>) =
            faces.iter().partition(|f| f.embedding.len() == dim);
        if !mismatched.is_empty() {
            warn!(
                count = mismatched.len(),
                expected = dim,
                "embeddings with unexpected dimension left unclustered"
            );
        }

        let groups = self.groups(&usable);
        let mut results = ClusteringResults {
            clusters: Vec::new(),
            noise: mismatched.iter().map(|f| f.face_id.clone()).collect(),
        };
        for group in groups {
            let ids = group.iter().map(|&i| usable[i].face_id.clone());
            if group.len() >= self.min_cluster_size.max(1) {
                results.clusters.push(ids.collect());
            } else {
                results.noise.extend(ids);
            }
        }
        results
            .clusters
            .sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        results.noise.sort();
        results
    }

    /// Indices of `faces` grouped by the dendrogram cut, each group in
    /// input order.
    fn groups(&self, faces: &[&FaceEmbedding]) -> Vec<Vec<usize>> {
        let n = faces.len();
        if n < 2 {
            return (0..n).map(|i| vec![i]).collect();
        }

        let normalized: Vec<Vec<f32>> =
            faces.par_iter().map(|f| normalize(&f.embedding)).collect();
        let mut condensed: Vec<f32> = (0..n)
            .into_par_iter()
            .flat_map_iter(|i| {
                let normalized = &normalized;
                (i + 1..n).map(move |j| {
                    cosine_distance(&normalized[i], &normalized[j])
                })
            })
            .collect();

        let dendrogram = linkage(&mut condensed, n, Method::Average);

        // Union every merge at or under the threshold. Step `i` creates
        // cluster label `n + i`.
        let mut parent: Vec<usize> = (0..2 * n - 1).collect();
        for (i, step) in dendrogram.steps().iter().enumerate() {
            if step.dissimilarity <= self.max_distance {
                union(&mut parent, step.cluster1, n + i);
                union(&mut parent, step.cluster2, n + i);
            }
        }

        let mut by_root: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..n {
            by_root.entry(find(&mut parent, i)).or_default().push(i);
        }
        let mut groups: Vec<Vec<usize>> = by_root.into_values().collect();
        groups.sort_by_key(|g| g[0]);
        debug!(faces = n, groups = groups.len(), "dendrogram cut");
        groups
    }
}

#[async_trait]
impl FaceClusterer for HierarchicalClusterer {
    fn method(&self) -> &str {
        METHOD
    }

    async fn cluster(
        &self,
        faces: &[FaceEmbedding],
        _prior: &LibraryMlData,
    ) -> Result<ClusteringResults> {
        let this = *self;
        let faces = faces.to_vec();
        tokio::task::spawn_blocking(move || this.cluster_blocking(&faces))
            .await
            .map_err(|e| Error::Clustering(e.to_string()))
    }
}

/// Most common non-zero embedding length.
fn dominant_dimension(faces: &[FaceEmbedding]) -> Option<usize> {
    let mut counts: HashMap<usize, usize> = HashMap::new();
    for face in faces {
        if !face.embedding.is_empty() {
            *counts.entry(face.embedding.len()).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(dim, _)| dim)
}

fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return vec![0.0; v.len()];
    }
    v.iter().map(|x| x / norm).collect()
}

/// Cosine distance of two unit vectors; zero vectors are maximally far
/// from everything.
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    if !dot.is_finite() {
        return 2.0;
    }
    let zero = |v: &[f32]| v.iter().all(|x| *x == 0.0);
    if zero(a) || zero(b) {
        return 2.0;
    }
    (1.0 - dot).clamp(0.0, 2.0)
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let (ra, rb) = (find(parent, a), find(parent, b));
    if ra != rb {
        parent[ra] = rb;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(id: &str, embedding: &[f32]) -> FaceEmbedding {
        FaceEmbedding {
            face_id: id.into(),
            file_id: 0,
            embedding: embedding.to_vec(),
        }
    }

    fn clusterer() -> HierarchicalClusterer {
        HierarchicalClusterer {
            max_distance: 0.35,
            min_cluster_size: 2,
        }
    }

    #[test]
    fn separates_two_people() {
        let faces = vec![
            face("a1", &[1.0, 0.0, 0.0]),
            face("b1", &[0.0, 1.0, 0.0]),
            face("a2", &[0.95, 0.05, 0.0]),
            face("b2", &[0.05, 0.98, 0.0]),
            face("a3", &[0.9, 0.1, 0.05]),
            face("loner", &[0.0, 0.0, 1.0]),
        ];
        let results = clusterer().cluster_blocking(&faces);

        assert_eq!(results.clusters.len(), 2);
        assert_eq!(results.clusters[0], vec!["a1", "a2", "a3"]);
        assert_eq!(results.clusters[1], vec!["b1", "b2"]);
        assert_eq!(results.noise, vec!["loner"]);
    }

    #[test]
    fn tiny_inputs() {
        assert_eq!(
            clusterer().cluster_blocking(&[]),
            ClusteringResults::default()
        );

        let one = clusterer().cluster_blocking(&[face("x", &[1.0, 0.0])]);
        assert!(one.clusters.is_empty());
        assert_eq!(one.noise, vec!["x"]);
    }

    #[test]
    fn mismatched_dimensions_become_noise() {
        let faces = vec![
            face("a", &[1.0, 0.0]),
            face("b", &[1.0, 0.01]),
            face("odd", &[1.0, 0.0, 0.0]),
        ];
        let results = clusterer().cluster_blocking(&faces);
        assert_eq!(results.clusters, vec![vec!["a", "b"]]);
        assert_eq!(results.noise, vec!["odd"]);
    }

    #[test]
    fn zero_vectors_do_not_join_clusters() {
        let faces = vec![face("z1", &[0.0, 0.0]), face("z2", &[0.0, 0.0])];
        let results = clusterer().cluster_blocking(&faces);
        assert!(results.clusters.is_empty());
        assert_eq!(results.noise.len(), 2);
    }

    #[test]
    fn cosine_distance_bounds() {
        let a = normalize(&[3.0, 4.0]);
        assert!(cosine_distance(&a, &a) < 1e-6);
        let b = normalize(&[-3.0, -4.0]);
        assert!((cosine_distance(&a, &b) - 2.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn async_entry_point() {
        let faces = vec![face("a", &[1.0, 0.0]), face("b", &[1.0, 0.0])];
        let results = clusterer()
            .cluster(&faces, &LibraryMlData::default())
            .await
            .unwrap();
        assert_eq!(results.clusters.len(), 1);
    }
}
