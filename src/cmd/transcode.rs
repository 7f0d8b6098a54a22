use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};

use retrogate::{load_config, CliOverrides, Transcoder};

/// Run the transcoder once, outside the gateway. Images are not re-encoded.
pub fn cmd_transcode(
    file: &str,
    url: Option<&str>,
    config_path: Option<&Path>,
    overrides: CliOverrides,
) -> Result<()> {
    let config = load_config(config_path, overrides)?;

    let mut input = Vec::new();
    if file == "-" {
        std::io::stdin()
            .read_to_end(&mut input)
            .context("reading stdin")?;
    } else {
        input = std::fs::read(file).with_context(|| format!("reading {file}"))?;
    }

    let html = Transcoder::new(config.transcode_config()).transcode(&input, url);

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(html.as_bytes())?;
    stdout.write_all(b"\n")?;
    Ok(())
}
