//! Archive format sniffing and in-memory extraction.
//!
//! Uploaded code archives carry no filename, so the format is inferred from
//! magic bytes. Extraction is fully in-memory: the whole file list is
//! materialized before anything is written to the blob store, so a bad
//! archive leaves no partial state behind.

use std::io::{Cursor, Read};
use std::path::Component;

use bytes::Bytes;

use crate::error::{BlobError, BlobResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    Zip,
}

/// Sniff the archive format from magic bytes.
pub fn detect(bytes: &[u8]) -> Option<ArchiveFormat> {
    if bytes.starts_with(&[0x1f, 0x8b]) {
        return Some(ArchiveFormat::TarGz);
    }
    if bytes.starts_with(b"PK\x03\x04") {
        return Some(ArchiveFormat::Zip);
    }
    // POSIX tar puts "ustar" at offset 257.
    if bytes.len() > 262 && &bytes[257..262] == b"ustar" {
        return Some(ArchiveFormat::Tar);
    }
    None
}

/// Extract every regular file as `(relative path, contents)`.
pub fn extract(bytes: &[u8]) -> BlobResult<Vec<(String, Bytes)>> {
    match detect(bytes).ok_or(BlobError::UnknownFormat)? {
        ArchiveFormat::Tar => extract_tar(bytes),
        ArchiveFormat::TarGz => {
            let mut raw = Vec::new();
            flate2::read::GzDecoder::new(bytes).read_to_end(&mut raw)?;
            extract_tar(&raw)
        }
        ArchiveFormat::Zip => extract_zip(bytes),
    }
}

fn extract_tar(bytes: &[u8]) -> BlobResult<Vec<(String, Bytes)>> {
    let mut archive = tar::Archive::new(bytes);
    let mut files = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry.path()?.into_owned();
        let Some(rel) = sanitize(path.components()) else {
            continue;
        };

        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        files.push((rel, Bytes::from(data)));
    }

    Ok(files)
}

fn extract_zip(bytes: &[u8]) -> BlobResult<Vec<(String, Bytes)>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| BlobError::Extract(e.to_string()))?;
    let mut files = Vec::new();

    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|e| BlobError::Extract(e.to_string()))?;
        if file.is_dir() {
            continue;
        }

        let Some(path) = file.enclosed_name() else {
            continue;
        };
        let Some(rel) = sanitize(path.components()) else {
            continue;
        };

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        files.push((rel, Bytes::from(data)));
    }

    Ok(files)
}

/// Join normal path components with `/`, rejecting absolute paths and
/// parent-directory escapes.
fn sanitize<'a>(components: impl Iterator<Item = Component<'a>>) -> Option<String> {
    let mut parts = Vec::new();
    for component in components {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    pub(crate) fn build_tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
        let tar = build_tar(files);
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar).unwrap();
        encoder.finish().unwrap()
    }

    pub(crate) fn build_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        for (path, data) in files {
            writer.start_file(*path, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn detects_all_supported_formats() {
        let files: &[(&str, &[u8])] = &[("index.js", b"hi")];
        assert_eq!(detect(&build_tar(files)), Some(ArchiveFormat::Tar));
        assert_eq!(detect(&build_tar_gz(files)), Some(ArchiveFormat::TarGz));
        assert_eq!(detect(&build_zip(files)), Some(ArchiveFormat::Zip));
        assert_eq!(detect(b"plain text"), None);
    }

    #[test]
    fn extracts_tar_gz_with_subdirectories() {
        let archive = build_tar_gz(&[
            ("index.js", b"console.log(1)"),
            ("lib/util.js", b"module.exports = {}"),
        ]);

        let mut files = extract(&archive).unwrap();
        files.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].0, "index.js");
        assert_eq!(&files[0].1[..], b"console.log(1)");
        assert_eq!(files[1].0, "lib/util.js");
    }

    #[test]
    fn extracts_zip() {
        let archive = build_zip(&[("main.py", b"print(1)")]);
        let files = extract(&archive).unwrap();
        assert_eq!(files, vec![("main.py".to_string(), Bytes::from_static(b"print(1)"))]);
    }

    #[test]
    fn unknown_format_is_rejected() {
        let err = extract(b"definitely not an archive").unwrap_err();
        assert!(matches!(err, BlobError::UnknownFormat));
    }

    #[test]
    fn sanitize_rejects_escapes() {
        use std::path::Path;
        assert_eq!(
            sanitize(Path::new("a/b.js").components()),
            Some("a/b.js".to_string())
        );
        assert_eq!(sanitize(Path::new("./a.js").components()), Some("a.js".to_string()));
        assert_eq!(sanitize(Path::new("../evil.js").components()), None);
        assert_eq!(sanitize(Path::new("/abs.js").components()), None);
    }
}
