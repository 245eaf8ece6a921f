use fitsio::errors::check_status;
use fitsio::sys::{self, fitsfile};
use fitsio::FitsFile;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::path::Path;
use thiserror::Error;

/// Buffer length for one header record, including the trailing NUL (FLEN_CARD in fitsio.h).
const FLEN_CARD: usize = 81;

/// cfitsio status for "keyword not found in header".
const KEY_NO_EXIST: c_int = 202;

/// Exit status used for library failures that carry no cfitsio status.
const NO_STATUS: i32 = 3;

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("cfitsio error {status}: {message}")]
    Fits { status: i32, message: String },
    #[error("invalid card text {0:?}")]
    InvalidCard(String),
    #[error(transparent)]
    Other(fitsio::errors::Error),
}

impl HeaderError {
    /// Status to hand back as the process exit code.
    pub fn status(&self) -> i32 {
        match self {
            HeaderError::Fits { status, .. } => *status,
            HeaderError::InvalidCard(_) | HeaderError::Other(_) => NO_STATUS,
        }
    }
}

impl From<fitsio::errors::Error> for HeaderError {
    fn from(e: fitsio::errors::Error) -> Self {
        match e {
            fitsio::errors::Error::Fits(fe) => HeaderError::Fits {
                status: fe.status,
                message: fe.message,
            },
            other => HeaderError::Other(other),
        }
    }
}

/// Numeric type used when writing calibration cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ValueType {
    /// Single precision, 7 significant digits.
    Float,
    /// Double precision, 15 significant digits.
    #[default]
    Double,
}

/// Key class as reported by `fits_get_keyclass`.
///
/// Lower classes are more fundamental to the file structure. Everything up to
/// and including [`KeyClass::COMPRESSION`] is needed to read the HDU at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KeyClass(pub i32);

impl KeyClass {
    pub const COMPRESSION: KeyClass = KeyClass(20);
    pub const USER: KeyClass = KeyClass(150);

    /// Classify a raw 80-column header record.
    pub fn of(card: &str) -> KeyClass {
        let Ok(c) = CString::new(card) else {
            return KeyClass::USER;
        };
        let mut bytes = c.into_bytes_with_nul();
        // ffgkcl = fits_get_keyclass
        let class = unsafe { sys::ffgkcl(bytes.as_mut_ptr() as *mut c_char) };
        KeyClass(class)
    }

    pub fn is_essential(self) -> bool {
        self <= KeyClass::COMPRESSION
    }
}

/// Card names that survive pruning regardless of their key class.
#[derive(Debug, Clone)]
pub struct AllowList {
    names: Vec<&'static str>,
}

impl AllowList {
    const BASE: [&'static str; 4] = ["BZERO   ", "BSCALE  ", "TRIMSEC ", "DATASEC "];
    const CHECKSUMS: [&'static str; 2] = ["CHECKSUM", "DATASUM "];

    pub fn new(keep_checksums: bool) -> Self {
        let mut names = Self::BASE.to_vec();
        if keep_checksums {
            names.extend(Self::CHECKSUMS);
        }
        AllowList { names }
    }

    /// Exact match on the first eight bytes of `card`, blank padded.
    pub fn keeps(&self, card: &str) -> bool {
        let name = format!("{:<8}", card.get(..8).unwrap_or(card));
        self.names.iter().any(|n| *n == name)
    }
}

/// Keyword of a header record, without padding.
pub fn card_name(card: &str) -> &str {
    card.get(..8).unwrap_or(card).trim_end()
}

/// Value field of a `KEY     = value / comment` record, quotes stripped.
pub fn card_value(card: &str) -> Option<String> {
    if card.len() <= 10 || card.get(8..10) != Some("= ") {
        return None;
    }
    let val_str = strip_fits_comment(card[10..].trim()).trim();
    if val_str.starts_with('\'') && val_str.ends_with('\'') && val_str.len() >= 2 {
        Some(
            val_str[1..val_str.len() - 1]
                .replace("''", "'")
                .trim()
                .to_string(),
        )
    } else {
        Some(val_str.to_string())
    }
}

/// Remove the ` / comment` part from a FITS value field, respecting quoted strings.
fn strip_fits_comment(s: &str) -> &str {
    let s = s.trim();
    if s.starts_with('\'') {
        // Quoted string, doubled quotes are escaped
        let mut i = 1;
        let bytes = s.as_bytes();
        while i < bytes.len() {
            if bytes[i] == b'\'' {
                if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                    i += 2;
                } else {
                    return &s[..=i];
                }
            } else {
                i += 1;
            }
        }
        s
    } else if let Some(pos) = s.find('/') {
        s[..pos].trim_end()
    } else {
        s
    }
}

/// A FITS file opened read-write for header editing.
///
/// All record-level operations act on the current HDU, selected with
/// [`FitsHeaderFile::select`]. The underlying handle is closed on drop.
pub struct FitsHeaderFile {
    fits: FitsFile,
}

impl FitsHeaderFile {
    pub fn open(path: &Path) -> Result<Self, HeaderError> {
        let fits = FitsFile::edit(path)?;
        Ok(FitsHeaderFile { fits })
    }

    pub fn hdu_count(&mut self) -> Result<usize, HeaderError> {
        let mut nhdu: c_int = 0;
        // ffthdu = fits_get_num_hdus
        self.call(|fptr, status| unsafe {
            sys::ffthdu(fptr, &mut nhdu, status);
        })?;
        Ok(nhdu.max(0) as usize)
    }

    /// Make the 1-based HDU `n` current.
    pub fn select(&mut self, n: usize) -> Result<(), HeaderError> {
        self.fits.hdu(n - 1)?;
        Ok(())
    }

    fn call<F>(&mut self, f: F) -> Result<(), HeaderError>
    where
        F: FnOnce(*mut fitsfile, &mut c_int),
    {
        let mut status = 0;
        let fptr = unsafe { self.fits.as_raw() };
        f(fptr, &mut status);
        check_status(status)?;
        Ok(())
    }

    /// Number of records in the current header, END excluded.
    pub fn record_count(&mut self) -> Result<usize, HeaderError> {
        let mut nexist: c_int = 0;
        // ffghsp = fits_get_hdrspace
        self.call(|fptr, status| unsafe {
            sys::ffghsp(fptr, &mut nexist, std::ptr::null_mut(), status);
        })?;
        Ok(nexist.max(0) as usize)
    }

    /// Read the 1-based record `pos` of the current header.
    pub fn record(&mut self, pos: usize) -> Result<String, HeaderError> {
        let mut buf = [0 as c_char; FLEN_CARD];
        // ffgrec = fits_read_record
        self.call(|fptr, status| unsafe {
            sys::ffgrec(fptr, pos as c_int, buf.as_mut_ptr(), status);
        })?;
        Ok(buf_to_string(&buf))
    }

    /// All records of the current header, in order.
    pub fn records(&mut self) -> Result<Vec<String>, HeaderError> {
        let n = self.record_count()?;
        (1..=n).map(|pos| self.record(pos)).collect()
    }

    /// Delete the 1-based record `pos`. Records after it shift down by one.
    pub fn delete_record(&mut self, pos: usize) -> Result<(), HeaderError> {
        // ffdrec = fits_delete_record
        self.call(|fptr, status| unsafe {
            sys::ffdrec(fptr, pos as c_int, status);
        })
    }

    /// Full record text for `key`, or `None` if the current header lacks it.
    pub fn find_card(&mut self, key: &str) -> Result<Option<String>, HeaderError> {
        let keyname = c_string(key)?;
        let mut buf = [0 as c_char; FLEN_CARD];
        let mut status: c_int = 0;
        unsafe {
            // ffgcrd = fits_read_card
            sys::ffgcrd(
                self.fits.as_raw(),
                keyname.as_ptr() as *mut c_char,
                buf.as_mut_ptr(),
                &mut status,
            );
        }
        match status {
            KEY_NO_EXIST => Ok(None),
            _ => {
                check_status(status)?;
                Ok(Some(buf_to_string(&buf)))
            }
        }
    }

    /// Write or overwrite an integer keyword.
    pub fn update_int(&mut self, key: &str, value: i64, comment: &str) -> Result<(), HeaderError> {
        let keyname = c_string(key)?;
        let comment = c_string(comment)?;
        // ffukyj = fits_update_key_lng
        self.call(|fptr, status| unsafe {
            sys::ffukyj(
                fptr,
                keyname.as_ptr() as *mut c_char,
                value,
                comment.as_ptr() as *mut c_char,
                status,
            );
        })
    }

    /// Write or overwrite a floating point keyword with the precision of `ty`.
    pub fn update_real(
        &mut self,
        key: &str,
        value: f64,
        ty: ValueType,
        comment: &str,
    ) -> Result<(), HeaderError> {
        let keyname = c_string(key)?;
        let comment = c_string(comment)?;
        self.call(|fptr, status| unsafe {
            match ty {
                // ffukye = fits_update_key_flt
                ValueType::Float => sys::ffukye(
                    fptr,
                    keyname.as_ptr() as *mut c_char,
                    value as f32,
                    -7,
                    comment.as_ptr() as *mut c_char,
                    status,
                ),
                // ffukyd = fits_update_key_dbl
                ValueType::Double => sys::ffukyd(
                    fptr,
                    keyname.as_ptr() as *mut c_char,
                    value,
                    -15,
                    comment.as_ptr() as *mut c_char,
                    status,
                ),
            };
        })
    }

    /// Append a literal record to the end of the current header.
    pub fn append_record(&mut self, card: &str) -> Result<(), HeaderError> {
        let card = c_string(card)?;
        // ffprec = fits_write_record
        self.call(|fptr, status| unsafe {
            sys::ffprec(fptr, card.as_ptr() as *mut c_char, status);
        })
    }

    /// Push buffered header changes to disk.
    pub fn flush(&mut self) -> Result<(), HeaderError> {
        // ffflus = fits_flush_file
        self.call(|fptr, status| unsafe {
            sys::ffflus(fptr, status);
        })
    }
}

fn c_string(s: &str) -> Result<CString, HeaderError> {
    CString::new(s).map_err(|_| HeaderError::InvalidCard(s.to_string()))
}

fn buf_to_string(buf: &[c_char]) -> String {
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_matches_padded_names() {
        let allow = AllowList::new(true);
        assert!(allow.keeps("BZERO   =                32768"));
        assert!(allow.keeps("BSCALE  =                    1"));
        assert!(allow.keeps("TRIMSEC = '[1:100,1:200]'"));
        assert!(allow.keeps("DATASEC = '[1:100,1:200]'"));
        assert!(allow.keeps("CHECKSUM= 'hcHjjc9ghcEghc9g'"));
        assert!(allow.keeps("DATASUM = '0       '"));
        assert!(!allow.keeps("BZEROX  =                    1"));
        assert!(!allow.keeps("GAIN    =                  1.5"));
        assert!(!allow.keeps("DATASECX= '[1:10]'"));
    }

    #[test]
    fn allow_list_can_drop_checksums() {
        let allow = AllowList::new(false);
        assert!(allow.keeps("BSCALE  =                    1"));
        assert!(!allow.keeps("CHECKSUM= 'hcHjjc9ghcEghc9g'"));
        assert!(!allow.keeps("DATASUM = '0       '"));
    }

    #[test]
    fn allow_list_handles_short_cards() {
        let allow = AllowList::new(true);
        assert!(allow.keeps("BZERO"));
        assert!(!allow.keeps(""));
    }

    #[test]
    fn classifies_structural_and_user_keys() {
        assert_eq!(KeyClass::of("SIMPLE  =                    T"), KeyClass(10));
        assert!(KeyClass::of("BITPIX  =                   16").is_essential());
        assert!(KeyClass::of("NAXIS1  =                  100").is_essential());
        assert!(KeyClass::of("XTENSION= 'IMAGE   '").is_essential());
        assert!(!KeyClass::of("BZERO   =                32768").is_essential());
        // TYP_HDUID_KEY, TYP_COMM_KEY
        assert_eq!(KeyClass::of("EXTNAME = 'SCI     '"), KeyClass(90));
        assert_eq!(KeyClass::of("HISTORY something happened"), KeyClass(130));
        assert_eq!(KeyClass::of("MYKEY   =                    1"), KeyClass::USER);
        assert!(KeyClass::USER > KeyClass::COMPRESSION);
    }

    #[test]
    fn extracts_card_name_and_value() {
        let card = "TRIMSEC = '[1:100,1:200]'  / trim section";
        assert_eq!(card_name(card), "TRIMSEC");
        assert_eq!(card_value(card).as_deref(), Some("[1:100,1:200]"));
        let ohdu = "OHDU    =                    3 / Original HDU";
        assert_eq!(card_value(ohdu).as_deref(), Some("3"));
        assert_eq!(card_value("HISTORY plain text"), None);
        assert_eq!(card_name("END"), "END");
    }
}
