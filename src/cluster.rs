//! Grouping books by embedding similarity.
//!
//! The pipeline is deliberately plain:
//!
//! 1. standardize each dimension (zero mean, unit variance)
//! 2. pick `k` by silhouette score over `min_k .. min(max_k + 1, n / 2)`
//! 3. K-means (k-means++ seeding, Lloyd iterations, `n_init` restarts)
//! 4. distance of every book to its centroid
//! 5. a 2-D PCA projection for scatter plots
//!
//! Everything random draws from one `StdRng` seeded with
//! `clustering.seed`, and labels are renumbered by first appearance, so
//! the same vectors and seed always produce the same assignment.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::books::{books_in_cluster, get_book};
use crate::config::{ClusteringConfig, Config};
use crate::db;
use crate::embedding::{cosine_similarity, load_embeddings};
use crate::error::ShelfError;
use crate::models::Book;

const POWER_ITERATIONS: usize = 200;
const POWER_TOLERANCE: f64 = 1e-10;
const NULL_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// Cluster index per input row, numbered by first appearance.
    pub labels: Vec<usize>,
    pub centroids: Vec<Vec<f64>>,
    /// Sum of squared distances to assigned centroids.
    pub inertia: f64,
}

fn sq_dist(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn dist(a: &[f64], b: &[f64]) -> f64 {
    sq_dist(a, b).sqrt()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalize(v: &mut [f64]) -> f64 {
    let norm = dot(v, v).sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    norm
}

/// Scale every column to zero mean and unit variance. Constant columns
/// become all zeros.
pub fn standardize(data: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = data.len();
    if n == 0 {
        return Vec::new();
    }
    let d = data[0].len();

    let mut mean = vec![0.0; d];
    for row in data {
        for (m, x) in mean.iter_mut().zip(row) {
            *m += x;
        }
    }
    mean.iter_mut().for_each(|m| *m /= n as f64);

    let mut std = vec![0.0; d];
    for row in data {
        for ((s, x), m) in std.iter_mut().zip(row).zip(&mean) {
            *s += (x - m) * (x - m);
        }
    }
    std.iter_mut().for_each(|s| *s = (*s / n as f64).sqrt());

    data.iter()
        .map(|row| {
            row.iter()
                .zip(&mean)
                .zip(&std)
                .map(|((x, m), s)| if *s > 1e-12 { (x - m) / s } else { 0.0 })
                .collect()
        })
        .collect()
}

fn kmeans_plus_plus(data: &[Vec<f64>], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let n = data.len();
    let mut centroids = vec![data[rng.gen_range(0..n)].clone()];
    let mut nearest: Vec<f64> = data.iter().map(|p| sq_dist(p, &centroids[0])).collect();

    while centroids.len() < k {
        let total: f64 = nearest.iter().sum();
        let next = if total > 0.0 {
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = n - 1;
            for (i, w) in nearest.iter().enumerate() {
                if target < *w {
                    chosen = i;
                    break;
                }
                target -= w;
            }
            chosen
        } else {
            // Every point coincides with a centroid already.
            rng.gen_range(0..n)
        };

        let centroid = data[next].clone();
        for (d, p) in nearest.iter_mut().zip(data) {
            *d = d.min(sq_dist(p, &centroid));
        }
        centroids.push(centroid);
    }

    centroids
}

/// Assign each point to its nearest centroid (ties go to the lower index).
/// Returns whether any label changed.
fn assign(data: &[Vec<f64>], centroids: &[Vec<f64>], labels: &mut [usize]) -> bool {
    let mut changed = false;
    for (p, label) in data.iter().zip(labels.iter_mut()) {
        let mut best = 0;
        let mut best_d = f64::INFINITY;
        for (j, c) in centroids.iter().enumerate() {
            let d = sq_dist(p, c);
            if d < best_d {
                best_d = d;
                best = j;
            }
        }
        if *label != best {
            *label = best;
            changed = true;
        }
    }
    changed
}

/// Move the point farthest from its centroid into each empty cluster.
fn reseed_empty(data: &[Vec<f64>], centroids: &mut [Vec<f64>], labels: &mut [usize]) -> bool {
    let k = centroids.len();
    let mut counts = vec![0usize; k];
    for &l in labels.iter() {
        counts[l] += 1;
    }

    let mut reseeded = false;
    for j in 0..k {
        if counts[j] > 0 {
            continue;
        }
        let farthest = (0..data.len())
            .filter(|&i| counts[labels[i]] > 1)
            .max_by(|&a, &b| {
                sq_dist(&data[a], &centroids[labels[a]])
                    .total_cmp(&sq_dist(&data[b], &centroids[labels[b]]))
                    .then(b.cmp(&a))
            });
        if let Some(i) = farthest {
            counts[labels[i]] -= 1;
            counts[j] = 1;
            labels[i] = j;
            centroids[j] = data[i].clone();
            reseeded = true;
        }
    }
    reseeded
}

fn update_centroids(data: &[Vec<f64>], labels: &[usize], centroids: &mut [Vec<f64>]) {
    let d = data[0].len();
    let mut sums = vec![vec![0.0; d]; centroids.len()];
    let mut counts = vec![0usize; centroids.len()];

    for (p, &l) in data.iter().zip(labels) {
        counts[l] += 1;
        for (s, x) in sums[l].iter_mut().zip(p) {
            *s += x;
        }
    }

    for ((c, s), n) in centroids.iter_mut().zip(sums).zip(counts) {
        if n > 0 {
            *c = s.into_iter().map(|x| x / n as f64).collect();
        }
    }
}

fn lloyd(data: &[Vec<f64>], mut centroids: Vec<Vec<f64>>, max_iter: usize) -> KMeansResult {
    let mut labels = vec![usize::MAX; data.len()];

    for _ in 0..max_iter.max(1) {
        let changed = assign(data, &centroids, &mut labels);
        let reseeded = reseed_empty(data, &mut centroids, &mut labels);
        update_centroids(data, &labels, &mut centroids);
        if !changed && !reseeded {
            break;
        }
    }

    let inertia = data
        .iter()
        .zip(&labels)
        .map(|(p, &l)| sq_dist(p, &centroids[l]))
        .sum();

    KMeansResult {
        labels,
        centroids,
        inertia,
    }
}

/// Renumber clusters in order of first appearance.
fn canonicalize(result: KMeansResult) -> KMeansResult {
    let mut mapping: HashMap<usize, usize> = HashMap::new();
    for &l in &result.labels {
        let next = mapping.len();
        mapping.entry(l).or_insert(next);
    }

    let labels = result.labels.iter().map(|l| mapping[l]).collect();
    let mut centroids = vec![Vec::new(); result.centroids.len()];
    let mut spare = mapping.len();
    for (old, c) in result.centroids.into_iter().enumerate() {
        let new = match mapping.get(&old) {
            Some(&n) => n,
            None => {
                spare += 1;
                spare - 1
            }
        };
        centroids[new] = c;
    }

    KMeansResult {
        labels,
        centroids,
        inertia: result.inertia,
    }
}

/// K-means with k-means++ seeding and `n_init` restarts.
///
/// Requires `1 <= k <= data.len()`.
pub fn kmeans(
    data: &[Vec<f64>],
    k: usize,
    seed: u64,
    n_init: usize,
    max_iter: usize,
) -> Result<KMeansResult> {
    if k == 0 || k > data.len() {
        return Err(ShelfError::validation(format!(
            "cannot form {} clusters from {} points",
            k,
            data.len()
        ))
        .into());
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut best: Option<KMeansResult> = None;

    for _ in 0..n_init.max(1) {
        let init = kmeans_plus_plus(data, k, &mut rng);
        let run = lloyd(data, init, max_iter);
        if best.as_ref().map_or(true, |b| run.inertia < b.inertia) {
            best = Some(run);
        }
    }

    match best {
        Some(b) => Ok(canonicalize(b)),
        None => Err(ShelfError::validation("k-means produced no result").into()),
    }
}

/// Mean silhouette coefficient with Euclidean distance.
///
/// Points in singleton clusters score 0; fewer than two clusters scores 0.
pub fn silhouette_score(data: &[Vec<f64>], labels: &[usize]) -> f64 {
    let n = data.len();
    let k = labels.iter().copied().max().map_or(0, |m| m + 1);
    if n == 0 || k < 2 {
        return 0.0;
    }

    let mut sizes = vec![0usize; k];
    for &l in labels {
        sizes[l] += 1;
    }
    if sizes.iter().filter(|&&s| s > 0).count() < 2 {
        return 0.0;
    }

    let mut total = 0.0;
    for i in 0..n {
        let own = labels[i];
        if sizes[own] <= 1 {
            continue;
        }

        let mut sums = vec![0.0; k];
        for j in 0..n {
            if i != j {
                sums[labels[j]] += dist(&data[i], &data[j]);
            }
        }

        let a = sums[own] / (sizes[own] - 1) as f64;
        let b = (0..k)
            .filter(|&c| c != own && sizes[c] > 0)
            .map(|c| sums[c] / sizes[c] as f64)
            .fold(f64::INFINITY, f64::min);

        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }

    total / n as f64
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct KChoice {
    pub k: usize,
    /// Silhouette score for the chosen `k`; 0 when no candidate was scored.
    pub score: f64,
    /// Every candidate that was tried, in order.
    pub scores: Vec<(usize, f64)>,
}

/// Pick the number of clusters by silhouette score.
pub fn choose_k(data: &[Vec<f64>], config: &ClusteringConfig) -> Result<KChoice> {
    let n = data.len();
    if n < config.min_k {
        return Err(ShelfError::validation(format!(
            "need at least {} books with embeddings to cluster, have {}",
            config.min_k, n
        ))
        .into());
    }

    let upper = (config.max_k + 1).min(n / 2);
    let mut scores = Vec::new();
    let mut best: Option<(usize, f64)> = None;

    for k in config.min_k..upper {
        let result = kmeans(data, k, config.seed, config.n_init, config.max_iter)?;
        let score = silhouette_score(data, &result.labels);
        tracing::debug!(k, score, "silhouette");
        scores.push((k, score));
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((k, score));
        }
    }

    let (k, score) = best.unwrap_or((config.min_k, 0.0));
    Ok(KChoice { k, score, scores })
}

/// Power iteration for the leading eigenvector of `XᵀX`, orthogonal to
/// every vector in `exclude`.
///
/// Returns the zero vector when the data has no variance left outside
/// `exclude`. Rounding noise below `NULL_TOLERANCE` relative to the total
/// variance counts as none.
fn principal_component(centered: &[Vec<f64>], exclude: &[Vec<f64>]) -> Vec<f64> {
    let d = centered[0].len();
    let total_variance: f64 = centered.iter().map(|row| dot(row, row)).sum();
    if total_variance == 0.0 {
        return vec![0.0; d];
    }

    let deflate = |v: &mut Vec<f64>| {
        for e in exclude {
            let proj = dot(v, e);
            v.iter_mut().zip(e).for_each(|(x, y)| *x -= proj * y);
        }
    };

    let mut v: Vec<f64> = (0..d).map(|i| 1.0 + i as f64 / d as f64).collect();
    let start_norm = dot(&v, &v).sqrt();
    deflate(&mut v);
    if normalize(&mut v) <= NULL_TOLERANCE * start_norm {
        return vec![0.0; d];
    }

    for _ in 0..POWER_ITERATIONS {
        let mut next = vec![0.0; d];
        for row in centered {
            let s = dot(row, &v);
            next.iter_mut().zip(row).for_each(|(n, x)| *n += s * x);
        }
        deflate(&mut next);
        if normalize(&mut next) <= NULL_TOLERANCE * total_variance {
            return vec![0.0; d];
        }
        // Normalizing can reintroduce a component along `exclude`.
        deflate(&mut next);
        normalize(&mut next);

        let delta = sq_dist(&next, &v);
        v = next;
        if delta < POWER_TOLERANCE {
            break;
        }
    }

    // Fix the sign so the largest component is positive.
    let pivot = v
        .iter()
        .copied()
        .fold(0.0f64, |acc, x| if x.abs() > acc.abs() { x } else { acc });
    if pivot < 0.0 {
        v.iter_mut().for_each(|x| *x = -*x);
    }
    v
}

/// Project rows onto their top two principal components.
pub fn project_2d(data: &[Vec<f64>]) -> Vec<[f64; 2]> {
    let n = data.len();
    if n == 0 {
        return Vec::new();
    }
    let d = data[0].len();
    if d == 0 {
        return vec![[0.0, 0.0]; n];
    }

    let mut mean = vec![0.0; d];
    for row in data {
        mean.iter_mut().zip(row).for_each(|(m, x)| *m += x);
    }
    mean.iter_mut().for_each(|m| *m /= n as f64);
    let centered: Vec<Vec<f64>> = data
        .iter()
        .map(|row| row.iter().zip(&mean).map(|(x, m)| x - m).collect())
        .collect();

    let pc1 = principal_component(&centered, &[]);
    let pc2 = principal_component(&centered, std::slice::from_ref(&pc1));

    centered
        .iter()
        .map(|row| [dot(row, &pc1), dot(row, &pc2)])
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterAssignment {
    pub k: usize,
    pub silhouette: f64,
    pub labels: Vec<usize>,
    pub distances: Vec<f64>,
    pub projection: Vec<[f64; 2]>,
}

/// Cluster raw embedding vectors. Pure; no I/O.
pub fn cluster_embeddings(
    vectors: &[Vec<f32>],
    config: &ClusteringConfig,
) -> Result<ClusterAssignment> {
    let raw: Vec<Vec<f64>> = vectors
        .iter()
        .map(|v| v.iter().map(|&x| x as f64).collect())
        .collect();
    if let Some(first) = raw.first() {
        if raw.iter().any(|v| v.len() != first.len()) {
            return Err(ShelfError::validation("embeddings have mixed dimensions").into());
        }
    }

    let data = standardize(&raw);
    let choice = choose_k(&data, config)?;
    let result = kmeans(&data, choice.k, config.seed, config.n_init, config.max_iter)?;

    let distances = data
        .iter()
        .zip(&result.labels)
        .map(|(p, &l)| dist(p, &result.centroids[l]))
        .collect();

    Ok(ClusterAssignment {
        k: choice.k,
        silhouette: choice.score,
        labels: result.labels,
        distances,
        projection: project_2d(&data),
    })
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClusterReport {
    pub books: usize,
    pub k: usize,
    pub silhouette: f64,
    pub cluster_sizes: Vec<ClusterSize>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClusterSize {
    pub cluster_id: i64,
    pub size: i64,
}

/// Cluster every book embedded with `model` and persist the assignment.
///
/// Books without an embedding have their cluster columns cleared.
pub async fn run_clustering(
    pool: &SqlitePool,
    config: &ClusteringConfig,
    model: &str,
) -> Result<ClusterReport> {
    let embedded = load_embeddings(pool, model).await?;
    let vectors: Vec<Vec<f32>> = embedded.iter().map(|(_, v)| v.clone()).collect();

    let assignment = cluster_embeddings(&vectors, config)?;

    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE books SET cluster_id = NULL, centroid_distance = NULL, proj_x = NULL, proj_y = NULL",
    )
    .execute(&mut *tx)
    .await?;

    for (i, (book_id, _)) in embedded.iter().enumerate() {
        let [x, y] = assignment.projection[i];
        sqlx::query(
            "UPDATE books SET cluster_id = ?, centroid_distance = ?, proj_x = ?, proj_y = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(assignment.labels[i] as i64)
        .bind(assignment.distances[i])
        .bind(x)
        .bind(y)
        .bind(now)
        .bind(book_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    let mut sizes = vec![0i64; assignment.k];
    for &l in &assignment.labels {
        sizes[l] += 1;
    }

    tracing::info!(
        books = embedded.len(),
        k = assignment.k,
        silhouette = assignment.silhouette,
        "clustering complete"
    );

    Ok(ClusterReport {
        books: embedded.len(),
        k: assignment.k,
        silhouette: assignment.silhouette,
        cluster_sizes: sizes
            .into_iter()
            .enumerate()
            .map(|(id, size)| ClusterSize {
                cluster_id: id as i64,
                size,
            })
            .collect(),
    })
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClusteringStats {
    pub clustered_books: i64,
    pub num_clusters: i64,
    pub cluster_sizes: Vec<ClusterSize>,
}

pub async fn clustering_stats(pool: &SqlitePool) -> Result<ClusteringStats> {
    let rows = sqlx::query(
        "SELECT cluster_id, COUNT(*) AS size FROM books \
         WHERE cluster_id IS NOT NULL GROUP BY cluster_id ORDER BY cluster_id",
    )
    .fetch_all(pool)
    .await?;

    let cluster_sizes: Vec<ClusterSize> = rows
        .iter()
        .map(|r| ClusterSize {
            cluster_id: r.get("cluster_id"),
            size: r.get("size"),
        })
        .collect();

    Ok(ClusteringStats {
        clustered_books: cluster_sizes.iter().map(|c| c.size).sum(),
        num_clusters: cluster_sizes.len() as i64,
        cluster_sizes,
    })
}

/// The `limit` books closest to the centroid of `cluster_id`.
pub async fn cluster_exemplars(
    pool: &SqlitePool,
    cluster_id: i64,
    limit: usize,
) -> Result<Vec<Book>> {
    let mut books = books_in_cluster(pool, cluster_id).await?;
    books.truncate(limit);
    Ok(books)
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterExemplars {
    pub cluster_id: i64,
    pub size: i64,
    pub books: Vec<Book>,
}

/// Exemplars for every cluster, in cluster order.
pub async fn all_exemplars(pool: &SqlitePool, limit: usize) -> Result<Vec<ClusterExemplars>> {
    let stats = clustering_stats(pool).await?;
    let mut out = Vec::with_capacity(stats.cluster_sizes.len());
    for c in stats.cluster_sizes {
        out.push(ClusterExemplars {
            cluster_id: c.cluster_id,
            size: c.size,
            books: cluster_exemplars(pool, c.cluster_id, limit).await?,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct SimilarBook {
    pub book: Book,
    pub similarity: f32,
}

/// Nearest neighbours of `book_id` by cosine similarity of stored vectors.
pub async fn similar_books(
    pool: &SqlitePool,
    book_id: &str,
    model: &str,
    limit: usize,
) -> Result<Vec<SimilarBook>> {
    get_book(pool, book_id).await?;

    let embedded = load_embeddings(pool, model).await?;
    let target = embedded
        .iter()
        .find(|(id, _)| id == book_id)
        .map(|(_, v)| v.clone())
        .ok_or_else(|| ShelfError::not_found(format!("embedding for book {}", book_id)))?;

    let mut scored: Vec<(&String, f32)> = embedded
        .iter()
        .filter(|(id, _)| id != book_id)
        .map(|(id, v)| (id, cosine_similarity(&target, v)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    scored.truncate(limit);

    let mut out = Vec::with_capacity(scored.len());
    for (id, similarity) in scored {
        out.push(SimilarBook {
            book: get_book(pool, id).await?,
            similarity,
        });
    }
    Ok(out)
}

/// Embedding model whose vectors are clustered.
pub fn clustering_model(config: &Config) -> Result<String> {
    config.embedding.model.clone().ok_or_else(|| {
        ShelfError::config("embedding.model must be set to cluster or find similar books").into()
    })
}

pub async fn run_cluster(config: &Config) -> Result<()> {
    let model = clustering_model(config)?;
    let pool = db::connect(config).await?;

    let report = run_clustering(&pool, &config.clustering, &model).await?;

    println!("cluster");
    println!("  books: {}", report.books);
    println!("  clusters: {}", report.k);
    println!("  silhouette: {:.3}", report.silhouette);
    for c in &report.cluster_sizes {
        println!("  cluster {}: {} books", c.cluster_id, c.size);
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Three tight, well separated blobs of `per` points each in 3-D.
    fn blobs(per: usize) -> Vec<Vec<f64>> {
        let centers = [[0.0, 0.0, 0.0], [10.0, 10.0, 0.0], [-10.0, 10.0, 5.0]];
        let mut out = Vec::new();
        for c in centers {
            for i in 0..per {
                let j = i as f64 * 0.1;
                out.push(vec![c[0] + j, c[1] - j, c[2] + j * 0.5]);
            }
        }
        out
    }

    fn cfg(min_k: usize, max_k: usize) -> ClusteringConfig {
        ClusteringConfig {
            min_k,
            max_k,
            ..ClusteringConfig::default()
        }
    }

    #[test]
    fn kmeans_separates_blobs() {
        let data = blobs(5);
        let r = kmeans(&data, 3, 42, 5, 100).unwrap();
        assert_eq!(r.labels[..5], [0; 5]);
        assert_eq!(r.labels[5..10], [1; 5]);
        assert_eq!(r.labels[10..], [2; 5]);
    }

    #[test]
    fn kmeans_is_deterministic_for_a_seed() {
        let data = standardize(&blobs(6));
        let a = kmeans(&data, 4, 7, 10, 300).unwrap();
        let b = kmeans(&data, 4, 7, 10, 300).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn kmeans_rejects_k_larger_than_n() {
        assert!(kmeans(&blobs(1), 4, 42, 1, 10).is_err());
    }

    #[test]
    fn silhouette_is_high_for_separated_blobs() {
        let data = blobs(5);
        let labels: Vec<usize> = (0..15).map(|i| i / 5).collect();
        assert!(silhouette_score(&data, &labels) > 0.9);
        assert_eq!(silhouette_score(&data, &vec![0; 15]), 0.0);
    }

    #[test]
    fn choose_k_finds_three_blobs() {
        let data = standardize(&blobs(5));
        let choice = choose_k(&data, &cfg(2, 6)).unwrap();
        assert_eq!(choice.k, 3);
        assert_eq!(choice.scores.len(), 5);
    }

    #[test]
    fn choose_k_falls_back_to_min_k_on_empty_range() {
        let data = standardize(&blobs(1));
        let choice = choose_k(&data, &cfg(3, 12)).unwrap();
        assert_eq!(choice.k, 3);
        assert!(choice.scores.is_empty());
    }

    #[test]
    fn choose_k_rejects_too_few_points() {
        let data = vec![vec![0.0], vec![1.0]];
        let err = choose_k(&data, &cfg(3, 12)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ShelfError>(),
            Some(ShelfError::Validation(_))
        ));
    }

    #[test]
    fn cluster_embeddings_is_stable_and_bounded() {
        let vectors: Vec<Vec<f32>> = blobs(6)
            .into_iter()
            .map(|v| v.into_iter().map(|x| x as f32).collect())
            .collect();
        let config = cfg(2, 5);

        let a = cluster_embeddings(&vectors, &config).unwrap();
        let b = cluster_embeddings(&vectors, &config).unwrap();

        assert_eq!(a, b);
        assert!(a.k >= config.min_k && a.k <= config.max_k);
        assert_eq!(a.labels.len(), vectors.len());
        assert!(a.distances.iter().all(|d| *d >= 0.0));
    }

    #[test]
    fn standardize_zeroes_constant_columns() {
        let data = vec![vec![1.0, 5.0], vec![3.0, 5.0]];
        let s = standardize(&data);
        assert_eq!(s, vec![vec![-1.0, 0.0], vec![1.0, 0.0]]);
    }

    #[test]
    fn projection_of_collinear_points_is_flat() {
        let data: Vec<Vec<f64>> = (0..6).map(|i| vec![i as f64, 2.0 * i as f64]).collect();
        let proj = project_2d(&data);
        assert_eq!(proj.len(), 6);
        assert!(proj.iter().all(|p| p[1].abs() < 1e-6));
        // Spread along the first axis matches the original spacing.
        let step = proj[1][0] - proj[0][0];
        assert!((step.abs() - 5f64.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn projection_of_planar_points_keeps_both_axes() {
        // Rank two in three dimensions: the third component is flat.
        let data: Vec<Vec<f64>> = (0..8)
            .map(|i| {
                let (a, b) = ((i % 4) as f64, (i / 4) as f64 * 3.0);
                vec![a, b, a + b]
            })
            .collect();
        let proj = project_2d(&data);
        let spread = |axis: usize| {
            let (lo, hi) = proj.iter().fold((f64::MAX, f64::MIN), |(lo, hi), p| {
                (lo.min(p[axis]), hi.max(p[axis]))
            });
            hi - lo
        };
        assert!(spread(0) > 1.0);
        assert!(spread(1) > 1.0);
        // The two axes are not copies of each other.
        assert!(proj.iter().any(|p| (p[0] - p[1]).abs() > 1e-3));
    }
}
