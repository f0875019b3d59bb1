//! .ipa 解包

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::core::ErrorKind;

/// 解压 .ipa 到 dest，返回 Payload/*.app 目录
pub fn unzip_app_bundle(archive: &Path, dest: &Path) -> Result<PathBuf, ErrorKind> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(BufReader::new(file))
        .map_err(|e| ErrorKind::InvalidBundle(format!("{}: {}", archive.display(), e)))?;

    fs::create_dir_all(dest)?;
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| ErrorKind::InvalidBundle(e.to_string()))?;
        // 拒绝越界路径
        let entry_path = match entry.enclosed_name() {
            Some(p) => p.to_path_buf(),
            None => continue,
        };

        let output_path = dest.join(&entry_path);
        if entry.is_dir() {
            fs::create_dir_all(&output_path)?;
        } else {
            if let Some(parent) = output_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&output_path)?;
            std::io::copy(&mut entry, &mut outfile)?;
        }
    }

    find_app_root(&dest.join("Payload"))
}

fn find_app_root(payload: &Path) -> Result<PathBuf, ErrorKind> {
    if !payload.is_dir() {
        return Err(ErrorKind::InvalidBundle("archive has no Payload directory".to_string()));
    }
    let mut apps: Vec<PathBuf> = fs::read_dir(payload)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && p.extension().map(|ext| ext == "app").unwrap_or(false))
        .collect();
    apps.sort();
    apps.into_iter()
        .next()
        .ok_or_else(|| ErrorKind::InvalidBundle("Payload contains no .app bundle".to_string()))
}
