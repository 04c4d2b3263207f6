// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Programmer selection. Vendors ship directories full of Firehose binaries
//! named after some subset of {chip, msm id, pk hash, oem, model}; given a
//! fingerprint we either find exactly one plausible match or hand the
//! decision back to the operator. Guessing wrong bricks sessions, so we
//! never guess.

use std::path::{Path, PathBuf};
use std::fs;

use crate::types::{DeviceFingerprint, EdlError, Result};

const LOADER_EXTENSIONS: [&str; 3] = ["elf", "mbn", "bin"];

fn loader_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| LOADER_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();
    Ok(files)
}

fn name_contains(path: &Path, needle: &str) -> bool {
    !needle.is_empty()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.to_ascii_lowercase().contains(&needle.to_ascii_lowercase()))
}

fn enumerate(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("  {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn ambiguous(fp: &DeviceFingerprint, what: &str, hits: &[PathBuf]) -> EdlError {
    EdlError::RequiresUserAction(format!(
        "multiple programmers match {what} for [{}]; pick one explicitly:\n{}",
        fp.describe(),
        enumerate(hits)
    ))
}

/// Pick a programmer for the fingerprinted device.
///
/// Match order: operator-supplied path, chip name + pk hash prefix, msm id,
/// chip name, then "the directory has exactly one loader". Anything
/// ambiguous or unmatched goes back to the operator with the fingerprint.
pub fn select_loader(
    fp: &DeviceFingerprint,
    explicit: Option<&Path>,
    dir: Option<&Path>,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_owned());
        }
        return Err(EdlError::RequiresUserAction(format!(
            "specified programmer {} does not exist",
            path.display()
        )));
    }

    let Some(dir) = dir else {
        return Err(EdlError::RequiresUserAction(format!(
            "no programmer specified and no loader directory to search for [{}]",
            fp.describe()
        )));
    };

    let files = loader_files(dir)?;
    if files.is_empty() {
        return Err(EdlError::RequiresUserAction(format!(
            "no .elf/.mbn/.bin programmers in {} for [{}]",
            dir.display(),
            fp.describe()
        )));
    }

    let chip = fp.chip_name.as_str();
    let pk16: &str = if fp.pk_hash.len() >= 16 {
        &fp.pk_hash[..16]
    } else {
        ""
    };

    // chip + pk hash prefix
    if !chip.is_empty() && !pk16.is_empty() {
        let hits: Vec<_> = files
            .iter()
            .filter(|p| name_contains(p, chip) && name_contains(p, pk16))
            .cloned()
            .collect();
        match hits.len() {
            0 => {}
            1 => return Ok(hits.into_iter().next().unwrap()),
            _ => return Err(ambiguous(fp, "chip and pk hash", &hits)),
        }
    }

    // msm id
    if fp.msm_id != 0 {
        let msm = format!("{:08x}", fp.msm_id);
        let hits: Vec<_> = files
            .iter()
            .filter(|p| name_contains(p, &msm))
            .cloned()
            .collect();
        match hits.len() {
            0 => {}
            1 => return Ok(hits.into_iter().next().unwrap()),
            _ => return Err(ambiguous(fp, "the msm id", &hits)),
        }
    }

    // chip alone
    if !chip.is_empty() {
        let hits: Vec<_> = files
            .iter()
            .filter(|p| name_contains(p, chip))
            .cloned()
            .collect();
        match hits.len() {
            0 => {}
            1 => return Ok(hits.into_iter().next().unwrap()),
            _ => return Err(ambiguous(fp, "the chip name", &hits)),
        }
    }

    // last resort: an unambiguous directory
    if files.len() == 1 {
        return Ok(files.into_iter().next().unwrap());
    }

    Err(EdlError::RequiresUserAction(format!(
        "no programmer in {} matches [{}]; candidates:\n{}",
        dir.display(),
        fp.describe(),
        enumerate(&files)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn fp(chip: &str, pk: &str, msm: u32) -> DeviceFingerprint {
        DeviceFingerprint {
            chip_name: chip.to_owned(),
            pk_hash: pk.to_owned(),
            msm_id: msm,
            ..Default::default()
        }
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let p = dir.join(name);
        File::create(&p).unwrap();
        p
    }

    #[test]
    fn chip_and_pk_prefix_beats_chip_alone() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "prog_sdm845_generic.mbn");
        let want = touch(dir.path(), "prog_sdm845_abcdef0123456789.mbn");

        let got = select_loader(
            &fp("SDM845", "abcdef0123456789deadbeef", 0),
            None,
            Some(dir.path()),
        )
        .unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn two_chip_matches_with_foreign_hashes_need_the_operator() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "prog_sdm845_1111111111111111.mbn");
        touch(dir.path(), "prog_sdm845_2222222222222222.mbn");

        let err = select_loader(
            &fp("SDM845", "abcdef0123456789deadbeef", 0),
            None,
            Some(dir.path()),
        )
        .unwrap_err();

        match err {
            EdlError::RequiresUserAction(msg) => {
                assert!(msg.contains("1111111111111111"));
                assert!(msg.contains("2222222222222222"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn msm_id_match() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "prog_random.elf");
        touch(dir.path(), "other_junk.txt");
        let want = touch(dir.path(), "prog_0008b0e1_firehose.elf");

        let got = select_loader(&fp("", "", 0x0008B0E1), None, Some(dir.path())).unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn single_loader_wins_without_any_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "readme.txt");
        let want = touch(dir.path(), "prog_firehose_ufs.elf");

        let got = select_loader(&fp("", "", 0), None, Some(dir.path())).unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn explicit_path_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = touch(dir.path(), "mine.mbn");
        touch(dir.path(), "other.mbn");

        let got = select_loader(&fp("SDM845", "", 0), Some(&explicit), Some(dir.path())).unwrap();
        assert_eq!(got, explicit);
    }
}
