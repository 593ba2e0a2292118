use std::io::{self, Write};

use serde::Serialize;

use crate::cache::CacheStats;
use crate::manager::SourceStatus;
use crate::processor::RunSummary;
use crate::scoring::{GeneSummary, RankedGene, ScoreLookup};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub sources: Vec<SourceStatus>,
    pub genes: usize,
    pub staged: usize,
    pub cache: CacheStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheClearResult {
    pub namespace: String,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopGenesResult {
    pub source: String,
    pub genes: Vec<RankedGene>,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(result: &RunSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_top_genes(result: &TopGenesResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_gene(result: &GeneSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &StatusReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_cache_clear(result: &CacheClearResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_summary(result: &RunSummary) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{} ({}): {}", result.source, result.mode, result.status)?;
        if let Some(cursor) = &result.resumed_from {
            writeln!(out, "  resumed from {cursor}")?;
        }
        if let Some(reason) = &result.restart_reason {
            writeln!(out, "  started over: {reason}")?;
        }
        writeln!(
            out,
            "  pages {}  facts {}  duplicates {}  genes {}",
            result.pages, result.facts, result.duplicates, result.genes_touched
        )?;
        writeln!(
            out,
            "  staged {}  conflicts {}  chunks {}  early flushes {}",
            result.staged, result.conflicts, result.chunks, result.early_flushes
        )?;
        writeln!(out, "  stopped: {:?}", result.stop_reason)?;
        Ok(())
    }

    pub fn print_top_genes(result: &TopGenesResult) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "top genes for {}", result.source)?;
        for (rank, gene) in result.genes.iter().enumerate() {
            let percentile = gene
                .percentile
                .map(|p| format!("{p:.1}"))
                .unwrap_or_else(|| "n/a".to_string());
            writeln!(
                out,
                "{:>4}. {:<12} {:>10.2}  p{}",
                rank + 1,
                gene.gene_symbol.as_str(),
                gene.value,
                percentile
            )?;
        }
        Ok(())
    }

    pub fn print_gene(result: &GeneSummary) -> io::Result<()> {
        let mut out = io::stdout().lock();
        let symbol = result
            .gene_symbol
            .as_ref()
            .map(|symbol| symbol.to_string())
            .unwrap_or_default();
        writeln!(out, "{} {}", result.gene_id, symbol)?;
        for score in &result.sources {
            let rendered = match &score.lookup {
                ScoreLookup::Ranked { percentile, value } => {
                    format!("p{percentile:.1} (value {value:.2})")
                }
                ScoreLookup::Insufficient { genes } => {
                    format!("not ranked ({genes} gene(s) with evidence)")
                }
                ScoreLookup::NoEvidence => "no evidence".to_string(),
            };
            writeln!(
                out,
                "  {:<12} {:>6} items  {}",
                score.source.as_str(),
                score.evidence_count,
                rendered
            )?;
        }
        match result.overall {
            Some(overall) => writeln!(out, "  overall p{overall:.1}")?,
            None => writeln!(out, "  overall n/a")?,
        }
        Ok(())
    }

    pub fn print_status(result: &StatusReport) -> io::Result<()> {
        let mut out = io::stdout().lock();
        for status in &result.sources {
            match &status.checkpoint {
                Some(checkpoint) => {
                    let cursor = checkpoint
                        .cursor
                        .as_ref()
                        .map(|cursor| cursor.to_string())
                        .unwrap_or_else(|| "done".to_string());
                    writeln!(
                        out,
                        "{:<12} {:<10} {} pages, {} items, next {}",
                        status.source.as_str(),
                        checkpoint.status.to_string(),
                        checkpoint.pages_completed,
                        checkpoint.items_processed,
                        cursor
                    )?;
                    if let Some(error) = &checkpoint.last_error {
                        writeln!(out, "{:<12} last error: {error}", "")?;
                    }
                }
                None => writeln!(out, "{:<12} never run", status.source.as_str())?,
            }
        }
        writeln!(out, "genes {}  staged for review {}", result.genes, result.staged)?;
        Ok(())
    }

    pub fn print_cache_clear(result: &CacheClearResult) -> io::Result<()> {
        writeln!(
            io::stdout(),
            "cleared {} entries from {}",
            result.removed, result.namespace
        )
    }
}
