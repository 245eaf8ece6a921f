use crate::fits::{
    card_name, card_value, AllowList, FitsHeaderFile, HeaderError, KeyClass, ValueType,
};
use crate::stats::StatsTable;
use log::{debug, info, warn};
use std::path::Path;

/// Keyword recording the 1-based position of the HDU before rewriting.
pub const OHDU_KEY: &str = "OHDU";
const OHDU_COMMENT: &str = "Original HDU";

/// Section keywords propagated to HDUs that lack them.
pub const GEOMETRY_KEYS: [&str; 2] = ["TRIMSEC", "DATASEC"];

#[derive(Debug, Clone)]
pub struct RewriteOptions {
    pub value_type: ValueType,
    /// Fill in TRIMSEC/DATASEC on HDUs that lack them.
    pub reconcile_geometry: bool,
    pub keep_checksums: bool,
    pub verbose: bool,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        RewriteOptions {
            value_type: ValueType::Double,
            reconcile_geometry: true,
            keep_checksums: true,
            verbose: false,
        }
    }
}

/// Where a geometry keyword was found and where it is missing.
#[derive(Debug, Clone, Default)]
struct GeometryScan {
    key: &'static str,
    seen: Vec<String>,
    missing: Vec<usize>,
}

impl GeometryScan {
    fn new(key: &'static str) -> Self {
        GeometryScan {
            key,
            ..Default::default()
        }
    }

    /// Smallest distinct card text seen, and whether there was more than one.
    fn canonical(&self) -> Option<(String, bool)> {
        let mut values = self.seen.clone();
        values.sort();
        values.dedup();
        let ambiguous = values.len() > 1;
        values.into_iter().next().map(|v| (v, ambiguous))
    }
}

/// Outcome of backfilling one geometry keyword.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryFill {
    pub key: &'static str,
    /// Card text written to the HDUs in `added_to`.
    pub card: String,
    /// 1-based HDU indices that received the card.
    pub added_to: Vec<usize>,
    /// More than one distinct value was present in the file.
    pub ambiguous: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RewriteReport {
    pub hdus: usize,
    /// Records removed from each HDU, in HDU order.
    pub deleted: Vec<usize>,
    pub geometry: Vec<GeometryFill>,
}

/// Rewrite every header of the FITS file at `path` in place.
pub fn rewrite_file(
    path: &Path,
    stats: &StatsTable,
    opts: &RewriteOptions,
) -> Result<RewriteReport, HeaderError> {
    let mut file = FitsHeaderFile::open(path)?;
    let report = rewrite(&mut file, stats, opts)?;
    file.flush()?;
    Ok(report)
}

/// Rewrite every header of an already opened file.
pub fn rewrite(
    file: &mut FitsHeaderFile,
    stats: &StatsTable,
    opts: &RewriteOptions,
) -> Result<RewriteReport, HeaderError> {
    let allow = AllowList::new(opts.keep_checksums);
    let mut scans: Vec<GeometryScan> = GEOMETRY_KEYS
        .iter()
        .map(|&k| GeometryScan::new(k))
        .collect();

    let hdus = file.hdu_count()?;
    let mut report = RewriteReport {
        hdus,
        ..Default::default()
    };

    for n in 1..=hdus {
        file.select(n)?;

        let deleted = prune(file, &allow)?;
        debug!("HDU {n}: removed {deleted} records");
        report.deleted.push(deleted);

        file.update_int(OHDU_KEY, n as i64, OHDU_COMMENT)?;

        if opts.reconcile_geometry {
            for scan in scans.iter_mut() {
                match file.find_card(scan.key)? {
                    Some(card) => scan.seen.push(card),
                    None => scan.missing.push(n),
                }
            }
        }

        for (key, value) in stats.iter() {
            file.update_real(key, value, opts.value_type, "")?;
        }

        if opts.verbose {
            for card in file.records()? {
                debug!("HDU {n}: {}", card.trim_end());
            }
        }
    }

    if opts.reconcile_geometry {
        for scan in &scans {
            if let Some(fill) = backfill(file, scan)? {
                report.geometry.push(fill);
            }
        }
    }

    info!(
        "rewrote {hdus} HDUs, {} records removed, {} stats cards per HDU",
        report.deleted.iter().sum::<usize>(),
        stats.len()
    );
    Ok(report)
}

/// Delete every record of the current header that is neither essential nor allowed.
///
/// Walks from the last record to the first so a deletion never shifts a
/// position that is still to be visited.
fn prune(file: &mut FitsHeaderFile, allow: &AllowList) -> Result<usize, HeaderError> {
    let mut deleted = 0;
    for pos in (1..=file.record_count()?).rev() {
        let card = file.record(pos)?;
        if KeyClass::of(&card).is_essential() || allow.keeps(&card) {
            continue;
        }
        debug!("deleting {}", card_name(&card));
        file.delete_record(pos)?;
        deleted += 1;
    }
    Ok(deleted)
}

fn backfill(
    file: &mut FitsHeaderFile,
    scan: &GeometryScan,
) -> Result<Option<GeometryFill>, HeaderError> {
    let Some((card, ambiguous)) = scan.canonical() else {
        debug!("no {} in any HDU", scan.key);
        return Ok(None);
    };
    if ambiguous {
        warn!(
            "there is more than one {} value, using {:?} but this may be wrong",
            scan.key, card
        );
    }

    for &n in &scan.missing {
        file.select(n)?;
        file.append_record(&card)?;
        debug!(
            "HDU {n}: added {} = {}",
            scan.key,
            card_value(&card).unwrap_or_default()
        );
    }

    Ok(Some(GeometryFill {
        key: scan.key,
        card,
        added_to: scan.missing.clone(),
        ambiguous,
    }))
}
