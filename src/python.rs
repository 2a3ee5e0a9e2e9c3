use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use std::path::PathBuf;

use crate::config::DedupConfig;
use crate::dedup::BatchDeduplicator;
use crate::document::Document;
use crate::error::DedupError;
use crate::minhash::{shingles, SignatureEngine};
use crate::similarity;

fn to_py_err(e: DedupError) -> PyErr {
    match e {
        DedupError::Config(msg) => PyValueError::new_err(msg),
        other => PyRuntimeError::new_err(other.to_string()),
    }
}

/// Exact Jaccard similarity of the character shingle sets of two texts.
#[pyfunction]
#[pyo3(signature = (a, b, char_ngram=5))]
pub fn jaccard(a: &str, b: &str, char_ngram: usize) -> f64 {
    similarity::jaccard(&shingles(a, char_ngram), &shingles(b, char_ngram))
}

#[pyfunction]
#[pyo3(signature = (text, char_ngram=5, num_seeds=50, num_bands=5, hash_width=4, seed=8787))]
pub fn band_hashes(
    text: &str,
    char_ngram: usize,
    num_seeds: usize,
    num_bands: usize,
    hash_width: usize,
    seed: u64,
) -> PyResult<Vec<i64>> {
    let config = DedupConfig {
        char_ngram,
        num_seeds,
        num_bands,
        hash_width,
        seed,
        ..DedupConfig::default()
    };
    let engine = SignatureEngine::new(&config).map_err(to_py_err)?;
    Ok(engine.signature(text).band_hashes)
}

/// Positions of `texts` that duplicate an earlier text of the list.
#[pyfunction]
#[pyo3(signature = (texts, urls=None, char_ngram=5, num_seeds=50, num_bands=5, jaccard_threshold=0.5, threads=0))]
pub fn find_duplicates(
    py: Python<'_>,
    texts: Vec<String>,
    urls: Option<Vec<String>>,
    char_ngram: usize,
    num_seeds: usize,
    num_bands: usize,
    jaccard_threshold: f64,
    threads: usize,
) -> PyResult<Vec<u64>> {
    if let Some(urls) = &urls {
        if urls.len() != texts.len() {
            return Err(PyValueError::new_err("urls and texts must have the same length"));
        }
    }
    let config = DedupConfig {
        char_ngram,
        num_seeds,
        num_bands,
        jaccard_threshold,
        filters: Vec::new(),
        ..DedupConfig::default()
    };
    let threads = if threads == 0 { num_cpus::get() } else { threads };

    py.detach(|| {
        let dedup = BatchDeduplicator::new(&config, threads).map_err(to_py_err)?;
        let docs: Vec<Document> = texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                let url = urls.as_ref().map(|u| u[i].clone()).unwrap_or_default();
                Document::new(i as u64, PathBuf::from("<memory>"), i.to_string(), url, text)
            })
            .collect();
        let refs: Vec<&Document> = docs.iter().collect();
        let (_, duplicates) = dedup.within_batch(&refs);
        Ok(duplicates.into_iter().collect())
    })
}

#[pymodule]
fn crawl_dedup(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(jaccard, m)?)?;
    m.add_function(wrap_pyfunction!(band_hashes, m)?)?;
    m.add_function(wrap_pyfunction!(find_duplicates, m)?)?;
    Ok(())
}
