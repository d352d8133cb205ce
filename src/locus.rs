//! Locus algebra (component A): chromosome normalization, region-string
//! parsing, bucketing into fixed-width bins, and overlap tests.
//!
//! Grounded on the teacher's own chromosome-name handling
//! (`common::CHROMS`, `common::build_chrom_map`) and its
//! `reciprocal_overlap` helper, generalized here from SV-specific interval
//! math into the locus/bucket model the specification requires.

use regex::Regex;

use crate::err::BioIndexError;

/// Bucket width in base pairs: a locus query reduces to equality lookups on
/// `floor(pos / STEP) * STEP`.
pub const STEP: i64 = 20_000;

/// Canonical chromosome tokens, in display order. `23..26` map onto the last
/// four via the numeric aliasing rule in the spec.
const CANONICAL: &[&str] = &[
    "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16", "17",
    "18", "19", "20", "21", "22", "X", "Y", "XY", "MT",
];

/// Normalize a chromosome token: case-insensitive, optional `chr` prefix,
/// numeric aliases `23->X`, `24->Y`, `25->XY`, `26|M->MT`.
pub fn normalize_chromosome(raw: &str) -> Result<String, BioIndexError> {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix("chr")
        .or_else(|| trimmed.strip_prefix("Chr"))
        .or_else(|| trimmed.strip_prefix("CHR"))
        .unwrap_or(trimmed);

    let upper = stripped.to_ascii_uppercase();
    let canonical = match upper.as_str() {
        "23" => "X",
        "24" => "Y",
        "25" => "XY",
        "26" | "M" => "MT",
        other => other,
    };

    if CANONICAL.iter().any(|c| *c == canonical) {
        Ok(canonical.to_string())
    } else {
        Err(BioIndexError::BadLocus(format!(
            "unknown chromosome: {:?}",
            raw
        )))
    }
}

/// Strip locale-independent thousands separators (`,`, `.`, `_`, spaces,
/// non-breaking spaces) from a run of digits before parsing it as an
/// integer.
fn parse_thousands_tolerant(raw: &str) -> Result<i64, BioIndexError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ',' | '_' | '\u{a0}' | ' '))
        .collect();
    // A literal '.' is only a thousands separator if there's no fractional
    // part implied (positions are always integral); strip it outright.
    let cleaned: String = cleaned.chars().filter(|c| *c != '.').collect();
    cleaned
        .parse::<i64>()
        .map_err(|e| BioIndexError::BadLocus(format!("invalid integer {:?}: {}", raw, e)))
}

/// A parsed, normalized locus: either a single-base SNP or a half-open region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locus {
    Snp { chrom: String, pos: i64 },
    Region { chrom: String, start: i64, stop: i64 },
}

impl Locus {
    pub fn chrom(&self) -> &str {
        match self {
            Locus::Snp { chrom, .. } => chrom,
            Locus::Region { chrom, .. } => chrom,
        }
    }

    /// One bucket per `STEP`-wide bin the locus touches.
    pub fn buckets(&self) -> Vec<(String, i64)> {
        match self {
            Locus::Snp { chrom, pos } => {
                vec![(chrom.clone(), pos.div_euclid(STEP) * STEP)]
            }
            Locus::Region { chrom, start, stop } => {
                let first = start.div_euclid(STEP);
                // `stop` is exclusive; the last base actually covered is stop - 1.
                let last_base = (*stop - 1).max(*start);
                let last = last_base.div_euclid(STEP);
                (first..=last)
                    .map(|bucket| (chrom.clone(), bucket * STEP))
                    .collect()
            }
        }
    }

    /// `overlaps(chrom, a, b)`: chromosome-equal AND, for a SNP, `a <= pos <
    /// b`; for a region, `b > start AND a < stop` (half-open intervals).
    pub fn overlaps(&self, chrom: &str, a: i64, b: i64) -> bool {
        if self.chrom() != chrom {
            return false;
        }
        match self {
            Locus::Snp { pos, .. } => a <= *pos && *pos < b,
            Locus::Region { start, stop, .. } => b > *start && a < *stop,
        }
    }

    /// Canonical rendering, used by the round-trip law and by the planner
    /// when it needs to log/display a query's locus.
    pub fn render(&self) -> String {
        match self {
            Locus::Snp { chrom, pos } => format!("{chrom}:{pos}"),
            Locus::Region { chrom, start, stop } => format!("{chrom}:{start}-{stop}"),
        }
    }
}

/// Lookup of gene name -> (chrom, start, stop), owned by the catalog
/// (`__Genes` table). Consulted only as a fallback when a region string
/// fails to parse as coordinates.
pub trait GeneLookup {
    fn lookup(&self, name: &str) -> Option<(String, i64, i64)>;
}

static REGION_RE: once_regex::OnceRegex = once_regex::OnceRegex::new(
    r"^(?P<chr>[A-Za-z0-9]+):(?P<pos>[0-9,._\u{a0} ]+)(?:(?P<op>[-+/])(?P<arg>[0-9,._\u{a0} ]+))?$",
);

mod once_regex {
    use regex::Regex;
    use std::sync::OnceLock;

    pub struct OnceRegex {
        pattern: &'static str,
        cell: OnceLock<Regex>,
    }

    impl OnceRegex {
        pub const fn new(pattern: &'static str) -> Self {
            Self {
                pattern,
                cell: OnceLock::new(),
            }
        }

        pub fn get(&self) -> &Regex {
            self.cell
                .get_or_init(|| Regex::new(self.pattern).expect("static regex is valid"))
        }
    }
}

/// Parse `chr:pos`, `chr:start-stop`, `chr:pos+len` (end = pos+len), or
/// `chr:pos/shift` (range = `[pos-shift, pos+shift+1)`), with an optional
/// gene-name fallback consulted only when the coordinate grammar fails to
/// match at all.
pub fn parse_locus(s: &str, genes: Option<&dyn GeneLookup>) -> Result<Locus, BioIndexError> {
    let re = REGION_RE.get();
    let caps = match re.captures(s.trim()) {
        Some(caps) => caps,
        None => return gene_fallback(s, genes),
    };

    let chrom = match normalize_chromosome(&caps["chr"]) {
        Ok(c) => c,
        Err(_) => return gene_fallback(s, genes),
    };

    let pos = match parse_thousands_tolerant(&caps["pos"]) {
        Ok(p) => p,
        Err(_) => return gene_fallback(s, genes),
    };

    let locus = match caps.name("op").map(|m| m.as_str()) {
        None => Locus::Snp { chrom, pos },
        Some(op) => {
            let arg = parse_thousands_tolerant(&caps["arg"])?;
            match op {
                "-" => Locus::Region {
                    chrom,
                    start: pos,
                    stop: arg + 1,
                },
                "+" => Locus::Region {
                    chrom,
                    start: pos,
                    stop: pos + arg,
                },
                "/" => Locus::Region {
                    chrom,
                    start: pos - arg,
                    stop: pos + arg + 1,
                },
                _ => unreachable!("regex only captures -, +, /"),
            }
        }
    };

    validate(locus)
}

fn gene_fallback(s: &str, genes: Option<&dyn GeneLookup>) -> Result<Locus, BioIndexError> {
    if let Some(genes) = genes {
        if let Some((chrom, start, stop)) = genes.lookup(s.trim()) {
            return validate(Locus::Region { chrom, start, stop });
        }
    }
    Err(BioIndexError::BadLocus(format!(
        "could not parse locus: {:?}",
        s
    )))
}

fn validate(locus: Locus) -> Result<Locus, BioIndexError> {
    if let Locus::Region { start, stop, .. } = &locus {
        if *stop <= *start {
            return Err(BioIndexError::BadRequest(format!(
                "region stop ({stop}) must exceed start ({start})"
            )));
        }
    }
    Ok(locus)
}

/// Compiles a schema template (e.g. `$chr:$pos*` or `$chr:$start-$stop`)
/// into a regex that extracts the locus fields from a single column value.
/// Group count (one placeholder pair vs. two) determines whether matches
/// yield a SNP or a Region.
pub struct LocusTemplate {
    regex: Regex,
    is_region: bool,
}

impl LocusTemplate {
    pub fn compile(template: &str) -> Result<Self, BioIndexError> {
        let is_region = template.contains("$start") && template.contains("$stop");
        if !is_region && !template.contains("$pos") {
            return Err(BioIndexError::BadRequest(format!(
                "locus template {:?} must reference $pos or $start/$stop",
                template
            )));
        }

        let mut pattern = regex::escape(template);
        for (placeholder, group) in [
            ("\\$chr", "(?P<chr>[A-Za-z0-9]+)"),
            ("\\$start", "(?P<start>[0-9]+)"),
            ("\\$stop", "(?P<stop>[0-9]+)"),
            ("\\$pos", "(?P<pos>[0-9]+)"),
        ] {
            pattern = pattern.replace(placeholder, group);
        }
        // `regex::escape` turns a literal `*`/`?` wildcard suffix into a
        // quoted character; templates use `*` to mean "rest of the field is
        // free", so restore it as a true wildcard.
        pattern = pattern.replace("\\*", ".*");

        let regex = Regex::new(&format!("^{pattern}$"))
            .map_err(|e| BioIndexError::BadRequest(format!("invalid locus template: {e}")))?;

        Ok(Self { regex, is_region })
    }

    pub fn apply(&self, value: &str) -> Option<Locus> {
        let caps = self.regex.captures(value)?;
        let chrom = normalize_chromosome(&caps["chr"]).ok()?;
        if self.is_region {
            let start: i64 = caps["start"].parse().ok()?;
            let stop: i64 = caps["stop"].parse().ok()?;
            validate(Locus::Region { chrom, start, stop }).ok()
        } else {
            let pos: i64 = caps["pos"].parse().ok()?;
            Some(Locus::Snp { chrom, pos })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rstest::rstest]
    #[case("1", "1")]
    #[case("chr1", "1")]
    #[case("CHRX", "X")]
    #[case("23", "X")]
    #[case("24", "Y")]
    #[case("25", "XY")]
    #[case("26", "MT")]
    #[case("chrM", "MT")]
    #[case("mt", "MT")]
    fn normalizes_chromosomes(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize_chromosome(raw).unwrap(), expected);
    }

    #[test]
    fn rejects_unknown_chromosome() {
        assert!(normalize_chromosome("chrZZ").is_err());
    }

    #[test]
    fn parses_snp() {
        let locus = parse_locus("chr9:21940123", None).unwrap();
        assert_eq!(
            locus,
            Locus::Snp {
                chrom: "9".into(),
                pos: 21940123
            }
        );
        assert_eq!(locus.buckets(), vec![("9".into(), 21_940_000)]);
    }

    #[test]
    fn parses_region() {
        let locus = parse_locus("9:21940000-22190000", None).unwrap();
        assert_eq!(
            locus,
            Locus::Region {
                chrom: "9".into(),
                start: 21_940_000,
                stop: 22_190_001
            }
        );
    }

    #[test]
    fn parses_region_with_length() {
        let locus = parse_locus("9:100+50", None).unwrap();
        assert_eq!(
            locus,
            Locus::Region {
                chrom: "9".into(),
                start: 100,
                stop: 150
            }
        );
    }

    #[test]
    fn parses_region_with_shift() {
        let locus = parse_locus("9:100/10", None).unwrap();
        assert_eq!(
            locus,
            Locus::Region {
                chrom: "9".into(),
                start: 90,
                stop: 111
            }
        );
    }

    #[test]
    fn tolerates_thousands_separators() {
        let locus = parse_locus("9:21,940,000-22,190,000", None).unwrap();
        assert_eq!(
            locus,
            Locus::Region {
                chrom: "9".into(),
                start: 21_940_000,
                stop: 22_190_001
            }
        );
    }

    #[test]
    fn rejects_stop_not_exceeding_start() {
        let err = parse_locus("chrX-chrX", None);
        assert!(err.is_err());
        let err = parse_locus("9:100-99", None);
        assert!(matches!(err, Err(BioIndexError::BadRequest(_))));
    }

    #[test]
    fn region_x_x_is_bad_request() {
        // "chr:X-X" shaped query where stop does not exceed start.
        let err = parse_locus("9:100-100", None);
        assert!(matches!(err, Err(BioIndexError::BadRequest(_))));
    }

    struct FakeGenes;
    impl GeneLookup for FakeGenes {
        fn lookup(&self, name: &str) -> Option<(String, i64, i64)> {
            if name == "BRCA1" {
                Some(("17".into(), 43_044_295, 43_125_483))
            } else {
                None
            }
        }
    }

    #[test]
    fn falls_back_to_gene_lookup() {
        let locus = parse_locus("BRCA1", Some(&FakeGenes)).unwrap();
        assert_eq!(locus.chrom(), "17");
    }

    #[test]
    fn fails_without_gene_lookup() {
        let err = parse_locus("BRCA1", None);
        assert!(matches!(err, Err(BioIndexError::BadLocus(_))));
    }

    #[test]
    fn round_trips_through_render() {
        for s in ["9:21940123", "9:21940000-22190001"] {
            let a = parse_locus(s, None).unwrap();
            let rendered = a.render();
            let b = parse_locus(&rendered, None).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn snp_overlap_is_half_open() {
        let locus = Locus::Snp {
            chrom: "9".into(),
            pos: 100,
        };
        assert!(locus.overlaps("9", 100, 101));
        assert!(!locus.overlaps("9", 101, 102));
        assert!(!locus.overlaps("8", 100, 101));
    }

    #[test]
    fn region_overlap_is_half_open() {
        let locus = Locus::Region {
            chrom: "9".into(),
            start: 100,
            stop: 200,
        };
        assert!(locus.overlaps("9", 150, 160));
        assert!(locus.overlaps("9", 50, 101));
        assert!(!locus.overlaps("9", 200, 250));
        assert!(!locus.overlaps("9", 0, 100));
    }

    #[test]
    fn template_snp() {
        let tmpl = LocusTemplate::compile("$chr:$pos*").unwrap();
        let locus = tmpl.apply("9:21940123:A:G").unwrap();
        assert_eq!(
            locus,
            Locus::Snp {
                chrom: "9".into(),
                pos: 21940123
            }
        );
    }

    #[test]
    fn template_region() {
        let tmpl = LocusTemplate::compile("$chr:$start-$stop").unwrap();
        let locus = tmpl.apply("9:100-200").unwrap();
        assert_eq!(
            locus,
            Locus::Region {
                chrom: "9".into(),
                start: 100,
                stop: 200
            }
        );
    }

    #[test]
    fn region_buckets_span_inclusive_steps() {
        let locus = Locus::Region {
            chrom: "9".into(),
            start: 19_999,
            stop: 40_001,
        };
        assert_eq!(
            locus.buckets(),
            vec![
                ("9".into(), 0),
                ("9".into(), 20_000),
                ("9".into(), 40_000)
            ]
        );
    }
}
