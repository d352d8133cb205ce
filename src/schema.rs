//! Schema compiler (component B): parses a compact schema string into an
//! ordered key specification plus an optional locus specification, and
//! compiles two artifacts from it — a per-record `IndexRow` generator and a
//! SQL filter predicate.
//!
//! Schema grammar (comma-separated segments, locus segment last if present):
//!   - key segment: `col1|col2|...` — alternative column names sharing one
//!     key slot.
//!   - locus segment, direct form: `chromCol:posCol` (SNP) or
//!     `chromCol:startCol-stopCol` / `chromCol:startCol-endCol` (region) —
//!     the record carries the locus pre-split across named columns.
//!   - locus segment, template form: `col=template` where `template`
//!     contains `$chr`, `$pos`, `$start`, `$stop` placeholders and binds a
//!     single source column whose string value is matched against them.

use serde_json::Value;

use crate::err::BioIndexError;
use crate::locus::{self, GeneLookup, Locus, LocusTemplate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySegment {
    /// Alternative column names sharing this key slot, in declaration order.
    pub alternatives: Vec<String>,
}

impl KeySegment {
    /// Column name used for this segment in the generated `IndexRow` table.
    pub fn sql_column(&self, index: usize) -> String {
        format!("key_{index}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocusColumns {
    /// `chromCol:posCol`
    Snp { chrom_col: String, pos_col: String },
    /// `chromCol:startCol-stopCol`
    Region {
        chrom_col: String,
        start_col: String,
        stop_col: String,
    },
    /// `col=template`
    Template { col: String, template: String },
}

#[derive(Debug, Clone)]
pub struct LocusSpec {
    pub columns: LocusColumns,
}

impl PartialEq for LocusSpec {
    fn eq(&self, other: &Self) -> bool {
        self.columns == other.columns
    }
}
impl Eq for LocusSpec {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub key_segments: Vec<KeySegment>,
    pub locus: Option<LocusSpec>,
}

impl Schema {
    /// `arity = |keySegments| + (locus? 1 : 0)`.
    pub fn arity(&self) -> usize {
        self.key_segments.len() + self.locus.is_some() as usize
    }

    pub fn parse(schema: &str) -> Result<Self, BioIndexError> {
        let segments: Vec<&str> = schema.split(',').map(str::trim).collect();
        if segments.is_empty() || segments.iter().all(|s| s.is_empty()) {
            return Err(BioIndexError::BadRequest(
                "schema must declare at least one key segment or a locus".to_string(),
            ));
        }

        let mut key_segments = Vec::new();
        let mut locus = None;

        for (i, segment) in segments.iter().enumerate() {
            let is_last = i == segments.len() - 1;
            if let Some(spec) = try_parse_locus_segment(segment)? {
                if !is_last {
                    return Err(BioIndexError::BadRequest(format!(
                        "locus segment {segment:?} must be the last schema segment"
                    )));
                }
                locus = Some(spec);
            } else {
                let alternatives: Vec<String> = segment
                    .split('|')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if alternatives.is_empty() {
                    return Err(BioIndexError::BadRequest(format!(
                        "empty key segment in schema {schema:?}"
                    )));
                }
                key_segments.push(KeySegment { alternatives });
            }
        }

        if key_segments.is_empty() && locus.is_none() {
            return Err(BioIndexError::BadRequest(
                "schema must declare at least one key segment or a locus".to_string(),
            ));
        }

        Ok(Schema {
            key_segments,
            locus,
        })
    }

    /// `col=?` per key segment, followed by `chromosome=? AND position
    /// BETWEEN ? AND ?` when a locus is present.
    pub fn sql_filter(&self, table: &str) -> String {
        let mut clauses: Vec<String> = self
            .key_segments
            .iter()
            .enumerate()
            .map(|(i, seg)| format!("{table}.{} = ?", seg.sql_column(i)))
            .collect();
        if self.locus.is_some() {
            clauses.push(format!(
                "{table}.chromosome = ? AND {table}.position BETWEEN ? AND ?"
            ));
        }
        clauses.join(" AND ")
    }

    /// Enumerates the Cartesian product of non-null key-alternative values
    /// per segment, paired with every locus bucket (if any). A segment whose
    /// alternatives are all null makes the product empty — the record
    /// contributes zero `IndexRow`s, which is not an error.
    pub fn generate_rows(
        &self,
        record: &serde_json::Map<String, Value>,
        genes: Option<&dyn GeneLookup>,
    ) -> Vec<GeneratedRow> {
        let mut per_segment: Vec<Vec<String>> = Vec::with_capacity(self.key_segments.len());
        for segment in &self.key_segments {
            let values: Vec<String> = segment
                .alternatives
                .iter()
                .filter_map(|col| record.get(col))
                .filter(|v| !v.is_null())
                .map(value_to_key_string)
                .collect();
            if values.is_empty() {
                // Any segment with no present alternative kills the whole
                // Cartesian product; no IndexRows, no error.
                return Vec::new();
            }
            per_segment.push(values);
        }

        let buckets: Vec<Option<(String, i64)>> = match &self.locus {
            None => vec![None],
            Some(spec) => match locus_for_record(spec, record, genes) {
                Some(locus) => locus.buckets().into_iter().map(Some).collect(),
                None => return Vec::new(),
            },
        };

        cartesian(&per_segment)
            .into_iter()
            .flat_map(|keys| {
                buckets.iter().map(move |bucket| GeneratedRow {
                    keys: keys.clone(),
                    chromosome: bucket.as_ref().map(|(c, _)| c.clone()),
                    position: bucket.as_ref().map(|(_, p)| *p),
                })
            })
            .collect()
    }

    /// Parses `q[-1]` (the final query argument) as a locus when the schema
    /// has one, yielding the bucketed `(chrom, start, stop)` triple the
    /// planner binds into the SQL `BETWEEN`, plus the exact `Locus` used for
    /// the reader's post-filter.
    pub fn parse_query_locus(
        &self,
        raw: &str,
        genes: Option<&dyn GeneLookup>,
    ) -> Result<(Locus, String, i64, i64), BioIndexError> {
        let locus = locus::parse_locus(raw, genes)?;
        let buckets = locus.buckets();
        let start = buckets.first().map(|(_, p)| *p).unwrap_or_default();
        let stop = buckets.last().map(|(_, p)| *p).unwrap_or_default();
        Ok((locus.clone(), locus.chrom().to_string(), start, stop))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedRow {
    pub keys: Vec<String>,
    pub chromosome: Option<String>,
    pub position: Option<i64>,
}

fn value_to_key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn cartesian(segments: &[Vec<String>]) -> Vec<Vec<String>> {
    segments.iter().fold(vec![Vec::new()], |acc, values| {
        acc.into_iter()
            .flat_map(|prefix| {
                values.iter().map(move |v| {
                    let mut next = prefix.clone();
                    next.push(v.clone());
                    next
                })
            })
            .collect()
    })
}

fn locus_for_record(
    spec: &LocusSpec,
    record: &serde_json::Map<String, Value>,
    genes: Option<&dyn GeneLookup>,
) -> Option<Locus> {
    match &spec.columns {
        LocusColumns::Snp { chrom_col, pos_col } => {
            let chrom = record.get(chrom_col)?.as_str()?;
            let chrom = locus::normalize_chromosome(chrom).ok()?;
            let pos = json_number(record.get(pos_col)?)?;
            Some(Locus::Snp { chrom, pos })
        }
        LocusColumns::Region {
            chrom_col,
            start_col,
            stop_col,
        } => {
            let chrom = record.get(chrom_col)?.as_str()?;
            let chrom = locus::normalize_chromosome(chrom).ok()?;
            let start = json_number(record.get(start_col)?)?;
            let stop = json_number(record.get(stop_col)?)?;
            if stop <= start {
                return None;
            }
            Some(Locus::Region { chrom, start, stop })
        }
        LocusColumns::Template { col, template } => {
            let value = record.get(col)?.as_str()?;
            let compiled = LocusTemplate::compile(template).ok()?;
            let locus = compiled.apply(value)?;
            let _ = genes; // template form never needs the gene fallback
            Some(locus)
        }
    }
}

fn json_number(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn try_parse_locus_segment(segment: &str) -> Result<Option<LocusSpec>, BioIndexError> {
    if let Some((col, template)) = segment.split_once('=') {
        if template.contains('$') {
            return Ok(Some(LocusSpec {
                columns: LocusColumns::Template {
                    col: col.trim().to_string(),
                    template: template.trim().to_string(),
                },
            }));
        }
        return Err(BioIndexError::BadRequest(format!(
            "locus template {segment:?} missing $chr/$pos/$start/$stop placeholders"
        )));
    }

    if let Some((chrom_col, rest)) = segment.split_once(':') {
        if !rest.contains('|') && (rest.contains(':') || segment.matches(':').count() > 1) {
            return Err(BioIndexError::BadRequest(format!(
                "malformed locus segment: {segment:?}"
            )));
        }
        return if let Some((start_col, stop_col)) = rest.split_once('-') {
            Ok(Some(LocusSpec {
                columns: LocusColumns::Region {
                    chrom_col: chrom_col.trim().to_string(),
                    start_col: start_col.trim().to_string(),
                    stop_col: stop_col.trim().to_string(),
                },
            }))
        } else {
            Ok(Some(LocusSpec {
                columns: LocusColumns::Snp {
                    chrom_col: chrom_col.trim().to_string(),
                    pos_col: rest.trim().to_string(),
                },
            }))
        };
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_key_only_schema() {
        let schema = Schema::parse("phenotype").unwrap();
        assert_eq!(schema.arity(), 1);
        assert!(schema.locus.is_none());
    }

    #[test]
    fn parses_key_and_region_schema() {
        let schema = Schema::parse("phenotype,chr:start-end").unwrap();
        assert_eq!(schema.arity(), 2);
        assert_eq!(
            schema.locus.as_ref().unwrap().columns,
            LocusColumns::Region {
                chrom_col: "chr".into(),
                start_col: "start".into(),
                stop_col: "end".into(),
            }
        );
    }

    #[test]
    fn parses_template_schema() {
        let schema = Schema::parse("varId=$chr:$pos*").unwrap();
        assert_eq!(schema.arity(), 1);
        assert_eq!(
            schema.locus.as_ref().unwrap().columns,
            LocusColumns::Template {
                col: "varId".into(),
                template: "$chr:$pos*".into(),
            }
        );
    }

    #[test]
    fn rejects_locus_not_last() {
        assert!(Schema::parse("chr:pos,phenotype").is_err());
    }

    #[test]
    fn rejects_empty_schema() {
        assert!(Schema::parse("").is_err());
    }

    #[test]
    fn key_alternatives_parse() {
        let schema = Schema::parse("id1|id2,chr:pos").unwrap();
        assert_eq!(
            schema.key_segments[0].alternatives,
            vec!["id1".to_string(), "id2".to_string()]
        );
    }

    #[test]
    fn generates_rows_for_template_locus() {
        let schema = Schema::parse("varId=$chr:$pos*").unwrap();
        let record: serde_json::Map<String, Value> =
            json!({"varId": "9:21940123:A:G"}).as_object().unwrap().clone();
        let rows = schema.generate_rows(&record, None);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].chromosome.as_deref(), Some("9"));
        assert_eq!(rows[0].position, Some(21_940_000));
    }

    #[test]
    fn generates_rows_for_region_locus_with_key() {
        let schema = Schema::parse("phenotype,chr:start-end").unwrap();
        let record: serde_json::Map<String, Value> = json!({
            "phenotype": "T2D",
            "chr": "9",
            "start": 21_940_000,
            "end": 22_190_000,
        })
        .as_object()
        .unwrap()
        .clone();
        let rows = schema.generate_rows(&record, None);
        // region spans buckets 21_940_000..=22_180_000 inclusive -> 13 buckets
        assert_eq!(rows.len(), 13);
        assert!(rows.iter().all(|r| r.keys == vec!["T2D".to_string()]));
    }

    #[test]
    fn null_key_alternative_yields_no_rows() {
        let schema = Schema::parse("id1|id2").unwrap();
        let record: serde_json::Map<String, Value> =
            json!({"other": "x"}).as_object().unwrap().clone();
        assert!(schema.generate_rows(&record, None).is_empty());
    }

    #[test]
    fn multiple_present_alternatives_cross_product() {
        let schema = Schema::parse("id1|id2").unwrap();
        let record: serde_json::Map<String, Value> = json!({"id1": "A", "id2": "B"})
            .as_object()
            .unwrap()
            .clone();
        let rows = schema.generate_rows(&record, None);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn sql_filter_shape() {
        let schema = Schema::parse("phenotype,chr:start-end").unwrap();
        assert_eq!(
            schema.sql_filter("t"),
            "t.key_0 = ? AND t.chromosome = ? AND t.position BETWEEN ? AND ?"
        );
    }
}
