//! 集成测试共用：生成测试用 .ipa

#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use sideloader::install::bundle::info_plist;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// 在 dir 下生成 <name>.ipa：Payload/<name>.app/{Info.plist, 可执行文件[, PlugIns/Widget.appex]}
pub fn build_ipa(dir: &Path, bundle_identifier: &str, name: &str, with_extension: bool) -> PathBuf {
    let path = dir.join(format!("{name}.ipa"));
    let mut zip = ZipWriter::new(File::create(&path).unwrap());
    let options = SimpleFileOptions::default();
    let app = format!("Payload/{name}.app");

    zip.add_directory(format!("{app}/"), options).unwrap();
    zip.start_file(format!("{app}/Info.plist"), options).unwrap();
    zip.write_all(info_plist(bundle_identifier, name, "1.0").as_bytes()).unwrap();
    zip.start_file(format!("{app}/{name}"), options).unwrap();
    zip.write_all(b"\xCF\xFA\xED\xFE").unwrap();

    if with_extension {
        let appex = format!("{app}/PlugIns/Widget.appex");
        zip.add_directory(format!("{appex}/"), options).unwrap();
        zip.start_file(format!("{appex}/Info.plist"), options).unwrap();
        zip.write_all(info_plist(&format!("{bundle_identifier}.widget"), "Widget", "1.0").as_bytes())
            .unwrap();
    }

    zip.finish().unwrap();
    path
}

/// 目录是否为空（不存在视为空）
pub fn is_empty_dir(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}
