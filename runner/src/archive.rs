// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::BTreeSet;
use std::io::{Cursor, Read};

use tar::{Builder, EntryType, Header};
use zip::ZipArchive;

use crate::error::RunError;

const ENTRY_UID: u64 = 1000;
const ENTRY_GID: u64 = 1000;
const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

/// Converts a client-supplied ZIP archive into a tar byte stream suitable for
/// injection into a sandbox volume: ownership is normalised to uid/gid 1000,
/// and a single shared top-level directory, if present, is stripped from
/// every path. Entries that are neither directories nor regular files
/// (symlinks, devices, ...) are dropped.
pub fn zip_to_tar(body: &[u8]) -> Result<Vec<u8>, RunError> {
    let mut zip =
        ZipArchive::new(Cursor::new(body)).map_err(|err| RunError::new(err.to_string()))?;

    let strip_prefix = find_strip_prefix(&mut zip)?;

    let mut tar_bytes = Vec::new();
    {
        let mut builder = Builder::new(&mut tar_bytes);
        for index in 0..zip.len() {
            let mut entry = zip
                .by_index(index)
                .map_err(|err| RunError::new(err.to_string()))?;
            let is_dir = entry.is_dir();
            let is_file = entry.is_file();
            if !is_dir && !is_file {
                continue;
            }

            let path = strip(entry.name(), strip_prefix.as_deref());
            if path.is_empty() {
                continue;
            }

            let mut header = Header::new_gnu();
            header.set_uid(ENTRY_UID);
            header.set_gid(ENTRY_GID);
            if is_dir {
                header.set_entry_type(EntryType::Directory);
                header.set_mode(DIR_MODE);
                header.set_size(0);
                header.set_cksum();
                builder
                    .append_data(&mut header, &path, std::io::empty())
                    .map_err(|err| RunError::new(err.to_string()))?;
            } else {
                header.set_entry_type(EntryType::Regular);
                header.set_mode(FILE_MODE);
                header.set_size(entry.size());
                header.set_cksum();
                let mut contents = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut contents)
                    .map_err(|err| RunError::new(err.to_string()))?;
                builder
                    .append_data(&mut header, &path, Cursor::new(contents))
                    .map_err(|err| RunError::new(err.to_string()))?;
            }
        }
        builder
            .finish()
            .map_err(|err| RunError::new(err.to_string()))?;
    }
    Ok(tar_bytes)
}

/// If the archive's directory entries share exactly one top-level component,
/// that component is the strip prefix; otherwise there is none.
fn find_strip_prefix<R: Read + std::io::Seek>(
    zip: &mut ZipArchive<R>,
) -> Result<Option<String>, RunError> {
    let mut top_level_dirs = BTreeSet::new();
    for index in 0..zip.len() {
        let entry = zip
            .by_index(index)
            .map_err(|err| RunError::new(err.to_string()))?;
        if entry.is_dir() {
            if let Some(first) = first_component(entry.name()) {
                top_level_dirs.insert(first.to_string());
            }
        }
    }
    if top_level_dirs.len() == 1 {
        Ok(top_level_dirs.into_iter().next())
    } else {
        Ok(None)
    }
}

fn first_component(path: &str) -> Option<&str> {
    path.split('/').next().filter(|component| !component.is_empty())
}

fn strip(path: &str, prefix: Option<&str>) -> String {
    match prefix {
        Some(prefix) => {
            let prefixed = format!("{prefix}/");
            path.strip_prefix(prefixed.as_str())
                .unwrap_or(path)
                .to_string()
        }
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_zip(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
        let mut buffer = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buffer));
            let options: zip::write::FileOptions<()> = zip::write::FileOptions::default();
            for (name, contents) in entries {
                match contents {
                    Some(data) => {
                        writer.start_file(*name, options).unwrap();
                        writer.write_all(data).unwrap();
                    }
                    None => {
                        writer.add_directory(*name, options).unwrap();
                    }
                }
            }
            writer.finish().unwrap();
        }
        buffer
    }

    fn tar_entries(bytes: &[u8]) -> Vec<(String, u32, u64, u64, bool)> {
        let mut archive = tar::Archive::new(Cursor::new(bytes));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                let header = entry.header();
                (
                    entry.path().unwrap().to_string_lossy().into_owned(),
                    header.mode().unwrap(),
                    header.uid().unwrap(),
                    header.gid().unwrap(),
                    header.entry_type().is_dir(),
                )
            })
            .collect()
    }

    #[test]
    fn strips_single_top_level_directory() {
        let zip = build_zip(&[
            ("prog/", None),
            ("prog/main", Some(b"print('hi')")),
            ("prog/lib/", None),
            ("prog/lib/helper", Some(b"helper")),
        ]);
        let tar = zip_to_tar(&zip).unwrap();
        let entries = tar_entries(&tar);
        let names: Vec<&str> = entries.iter().map(|(name, ..)| name.as_str()).collect();
        assert!(names.contains(&"main"));
        assert!(names.contains(&"lib/helper"));
        assert!(!names.iter().any(|name| name.starts_with("prog")));
    }

    #[test]
    fn leaves_paths_untouched_when_multiple_top_level_dirs() {
        let zip = build_zip(&[
            ("a/", None),
            ("a/one", Some(b"1")),
            ("b/", None),
            ("b/two", Some(b"2")),
        ]);
        let tar = zip_to_tar(&zip).unwrap();
        let names: Vec<String> = tar_entries(&tar).into_iter().map(|(name, ..)| name).collect();
        assert!(names.contains(&"a/one".to_string()));
        assert!(names.contains(&"b/two".to_string()));
    }

    #[test]
    fn normalises_ownership_and_modes() {
        let zip = build_zip(&[("dir/", None), ("dir/file", Some(b"x"))]);
        let tar = zip_to_tar(&zip).unwrap();
        for (_, mode, uid, gid, is_dir) in tar_entries(&tar) {
            assert_eq!(uid, ENTRY_UID);
            assert_eq!(gid, ENTRY_GID);
            assert_eq!(mode, if is_dir { DIR_MODE } else { FILE_MODE });
        }
    }

    #[test]
    fn malformed_archive_is_a_client_error() {
        let result = zip_to_tar(b"definitely not a zip file");
        assert!(result.is_err());
    }
}
