// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Ballot package loading.
//
// A ballot package is a zip archive holding:
//
//   election.json   the election definition, hashed as stored
//   layouts.json    [{"layout": BallotPageLayout, "template": "<file>.png"}, ...]
//   <file>.png      one rasterized template per layout entry

use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Deserialize;
use tracing::{debug, info, instrument};
use zip::ZipArchive;

use ballotscan_core::election::ElectionDefinition;
use ballotscan_core::error::{BallotscanError, Result};
use ballotscan_core::layout::BallotPageLayout;
use ballotscan_image::decode_grayscale;

pub const ELECTION_FILE: &str = "election.json";
pub const LAYOUTS_FILE: &str = "layouts.json";

#[derive(Debug, Deserialize)]
struct LayoutEntry {
    layout: BallotPageLayout,
    template: String,
}

/// Election definition plus every template page, as loaded from a package.
#[derive(Debug, Clone)]
pub struct BallotPackage {
    pub election_definition: ElectionDefinition,
    /// Layouts with their PNG template bytes.
    pub templates: Vec<(BallotPageLayout, Vec<u8>)>,
}

fn package_err(what: impl std::fmt::Display) -> BallotscanError {
    BallotscanError::Package(what.to_string())
}

fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut entry = archive
        .by_name(name)
        .map_err(|e| package_err(format!("{name}: {e}")))?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Read a ballot package from any seekable source.
pub fn read_ballot_package_from<R: Read + Seek>(reader: R) -> Result<BallotPackage> {
    let mut archive = ZipArchive::new(reader).map_err(|e| package_err(format!("not a zip archive: {e}")))?;

    let election_data = String::from_utf8(read_entry(&mut archive, ELECTION_FILE)?)
        .map_err(|_| package_err(format!("{ELECTION_FILE} is not UTF-8")))?;
    let election_definition = ElectionDefinition::from_json(&election_data)?;

    let entries: Vec<LayoutEntry> = serde_json::from_slice(&read_entry(&mut archive, LAYOUTS_FILE)?)
        .map_err(|e| package_err(format!("{LAYOUTS_FILE}: {e}")))?;

    let mut templates = Vec::with_capacity(entries.len());
    for entry in entries {
        let layout = entry.layout;
        if election_definition.election.ballot_style(&layout.ballot_style_id).is_none() {
            return Err(package_err(format!(
                "layout references unknown ballot style {}",
                layout.ballot_style_id
            )));
        }
        if election_definition.election.precinct(&layout.precinct_id).is_none() {
            return Err(package_err(format!(
                "layout references unknown precinct {}",
                layout.precinct_id
            )));
        }

        let png = read_entry(&mut archive, &entry.template)?;
        let image = decode_grayscale(&png)
            .map_err(|e| package_err(format!("{}: {e}", entry.template)))?;
        if (image.width(), image.height()) != (layout.width, layout.height) {
            return Err(package_err(format!(
                "{} is {}x{}, layout expects {}x{}",
                entry.template,
                image.width(),
                image.height(),
                layout.width,
                layout.height
            )));
        }
        debug!(template = %entry.template, page_number = layout.page_number, "template loaded");
        templates.push((layout, png));
    }

    Ok(BallotPackage {
        election_definition,
        templates,
    })
}

#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn read_ballot_package(path: impl AsRef<Path>) -> Result<BallotPackage> {
    let package = read_ballot_package_from(File::open(path.as_ref())?)?;
    info!(
        election_hash = %package.election_definition.election_hash,
        templates = package.templates.len(),
        "ballot package loaded"
    );
    Ok(package)
}

/// Most recently modified `*.zip` in `dir`, if any.
pub fn find_newest_package(dir: impl AsRef<Path>) -> Result<Option<PathBuf>> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir.as_ref())? {
        let path = entry?.path();
        let is_zip = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
        if !is_zip || !path.is_file() {
            continue;
        }
        let modified = path.metadata()?.modified()?;
        if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use std::io::{Cursor, Write};

    use serde_json::json;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    use super::*;
    use crate::interpreter::test_support::template;
    use crate::qr::fixtures::ELECTION_JSON;

    /// Package zip bytes for the fixture election with four templates.
    pub fn package_bytes() -> Vec<u8> {
        let templates = [template(1, true), template(2, true), template(1, false), template(2, false)];
        let mut entries = Vec::new();
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();

        writer.start_file(ELECTION_FILE, options).expect("start election");
        writer.write_all(ELECTION_JSON.as_bytes()).expect("write election");
        for (i, (layout, png)) in templates.iter().enumerate() {
            let name = format!("template-{i}.png");
            writer.start_file(name.as_str(), options).expect("start template");
            writer.write_all(png).expect("write template");
            entries.push(json!({ "layout": layout, "template": name }));
        }
        writer.start_file(LAYOUTS_FILE, options).expect("start layouts");
        writer
            .write_all(serde_json::to_string(&entries).expect("layouts json").as_bytes())
            .expect("write layouts");
        writer.finish().expect("finish zip").into_inner()
    }
}
