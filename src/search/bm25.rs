use anyhow::{Context, Result as AnyResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::*;
use tantivy::tokenizer::{TextAnalyzer, WhitespaceTokenizer};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, Term};

use crate::error::Result;

/// Name under which the pre-normalized whitespace analyzer is registered.
const TOKENIZER_NAME: &str = "star_text";

/// Split text into lowercase alphanumeric tokens.
///
/// Case-folds, turns every non-alphanumeric character into a separator and
/// splits on whitespace, so identical input always yields identical tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Normalized text blob stored for a repository: its tokens joined by spaces.
pub fn normalize_text(text: &str) -> String {
    tokenize(text).join(" ")
}

/// BM25 text index built on tantivy.
///
/// Documents are stored already normalized by [`tokenize`], and the field is
/// analyzed with a plain whitespace tokenizer, so indexing and querying share
/// exactly one tokenization.
pub struct Bm25Index {
    #[allow(dead_code)]
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    f_id: Field,
    f_text: Field,
}

impl Bm25Index {
    /// Create or open a BM25 index at the given directory.
    pub fn open_or_create(index_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(index_dir)
            .with_context(|| format!("Failed to create {}", index_dir.display()))?;

        let index = if index_dir.join("meta.json").exists() {
            Index::open_in_dir(index_dir).context("Failed to open existing tantivy index")?
        } else {
            Index::create_in_dir(index_dir, build_schema())
                .context("Failed to create tantivy index")?
        };

        index.tokenizers().register(
            TOKENIZER_NAME,
            TextAnalyzer::builder(WhitespaceTokenizer::default()).build(),
        );

        let schema = index.schema();
        let f_id = schema.get_field("id").context("Text index has no id field")?;
        let f_text = schema
            .get_field("text")
            .context("Text index has no text field")?;

        let writer: IndexWriter = index
            .writer(50_000_000)
            .context("Failed to create index writer")?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .context("Failed to create reader")?;

        Ok(Self {
            index,
            reader,
            writer: Mutex::new(writer),
            f_id,
            f_text,
        })
    }

    /// Insert or replace the document for `id`.
    pub fn put(&self, id: &str, text: &str) -> Result<()> {
        let normalized = normalize_text(text);
        let mut writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.f_id, id));
        let outcome: AnyResult<()> = (|| {
            writer.add_document(doc!(
                self.f_id => id.to_string(),
                self.f_text => normalized,
            ))?;
            writer.commit()?;
            Ok(())
        })();
        self.finish_write(&mut writer, outcome.context("Failed to index document"))
    }

    /// Remove the document for `id`. Returns whether one existed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let existed = self.get(id)?.is_some();
        let mut writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.f_id, id));
        let outcome = writer
            .commit()
            .map(|_| ())
            .context("Failed to commit delete");
        self.finish_write(&mut writer, outcome)?;
        Ok(existed)
    }

    /// Drop every document.
    pub fn reset(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        let outcome: AnyResult<()> = (|| {
            writer.delete_all_documents()?;
            writer.commit()?;
            Ok(())
        })();
        self.finish_write(&mut writer, outcome.context("Failed to clear text index"))
    }

    /// Roll back pending operations on failure so they cannot leak into a
    /// later commit, then make committed changes visible to searchers.
    fn finish_write(&self, writer: &mut IndexWriter, outcome: AnyResult<()>) -> Result<()> {
        if let Err(e) = outcome {
            if let Err(rollback_err) = writer.rollback() {
                tracing::warn!("Text index rollback failed: {rollback_err}");
            }
            return Err(e.into());
        }
        self.reader.reload().context("Failed to reload text index reader")?;
        Ok(())
    }

    /// Rank documents against `terms` by BM25, best first.
    ///
    /// Terms are re-tokenized, so callers may pass raw words. Equal scores
    /// are ordered by id ascending. Terms that match nothing yield an empty
    /// result.
    pub fn query(&self, terms: &[String], top_k: usize) -> Result<Vec<(String, f32)>> {
        let terms: BTreeSet<String> = terms.iter().flat_map(|t| tokenize(t)).collect();
        if terms.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let num_docs = searcher.num_docs() as usize;
        if num_docs == 0 {
            return Ok(Vec::new());
        }

        let clauses: Vec<(Occur, Box<dyn Query>)> = terms
            .iter()
            .map(|t| {
                let query: Box<dyn Query> = Box::new(TermQuery::new(
                    Term::from_field_text(self.f_text, t),
                    IndexRecordOption::WithFreqs,
                ));
                (Occur::Should, query)
            })
            .collect();
        let query = BooleanQuery::new(clauses);

        // Collect every match so the id tie-break is applied over the full set.
        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(num_docs))
            .context("Search failed")?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(doc_address)
                .context("Failed to retrieve document")?;
            if let Some(id) = doc.get_first(self.f_id).and_then(|v| v.as_str()) {
                hits.push((id.to_string(), score));
            }
        }

        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Stored normalized text for `id`.
    pub fn get(&self, id: &str) -> Result<Option<String>> {
        let searcher = self.reader.searcher();
        let query = TermQuery::new(
            Term::from_field_text(self.f_id, id),
            IndexRecordOption::Basic,
        );
        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(1))
            .context("Lookup failed")?;

        match top_docs.into_iter().next() {
            Some((_, doc_address)) => {
                let doc: TantivyDocument = searcher
                    .doc(doc_address)
                    .context("Failed to retrieve document")?;
                Ok(doc
                    .get_first(self.f_text)
                    .and_then(|v| v.as_str())
                    .map(str::to_string))
            }
            None => Ok(None),
        }
    }

    /// Every indexed id with its stored text.
    pub fn entries(&self) -> Result<BTreeMap<String, String>> {
        let searcher = self.reader.searcher();
        let num_docs = searcher.num_docs() as usize;
        let mut entries = BTreeMap::new();
        if num_docs == 0 {
            return Ok(entries);
        }

        let top_docs = searcher
            .search(&AllQuery, &TopDocs::with_limit(num_docs))
            .context("Failed to enumerate text index")?;
        for (_, doc_address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(doc_address)
                .context("Failed to retrieve document")?;
            let id = doc.get_first(self.f_id).and_then(|v| v.as_str());
            let text = doc.get_first(self.f_text).and_then(|v| v.as_str());
            if let (Some(id), Some(text)) = (id, text) {
                entries.insert(id.to_string(), text.to_string());
            }
        }
        Ok(entries)
    }

    pub fn len(&self) -> usize {
        self.reader.searcher().num_docs() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_schema() -> Schema {
    let mut schema_builder = Schema::builder();
    schema_builder.add_text_field("id", STRING | STORED);
    let text_options = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(TOKENIZER_NAME)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();
    schema_builder.add_text_field("text", text_options);
    schema_builder.build()
}
