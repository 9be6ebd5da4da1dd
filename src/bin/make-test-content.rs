use anyhow::{bail, Context, Result};
use tracing::info;

use flatpak_oci_fixtures::{logging, preflight, Builder, FixturesConfig, OciLayout, SourceImage};

fn usage() -> &'static str {
    "Usage:\n  make-test-content            build all test content\n  make-test-content verify     re-hash every blob in the layout"
}

fn main() -> Result<()> {
    logging::init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = FixturesConfig::load()?;

    match args.as_slice() {
        [] => build(&config),
        [verify] if verify == "verify" => verify_layout(&config),
        _ => bail!(usage()),
    }
}

fn build(config: &FixturesConfig) -> Result<()> {
    let source = SourceImage::new(&config.source.path);
    if !source.exists() {
        if !config.source.fetch {
            bail!(
                "source image '{}' does not exist and fetching is disabled",
                source.path().display()
            );
        }
        preflight::check_fetch_tools()?;
        source
            .fetch(&config.source.image)
            .with_context(|| format!("fetching {}", config.source.image))?;
    }

    let layout = OciLayout::create(&config.layout.path)?;
    let built = Builder::new(layout, source).build_all()?;
    for item in &built {
        info!(tag = %item.tag, index = %item.index.digest, "ready");
    }
    Ok(())
}

fn verify_layout(config: &FixturesConfig) -> Result<()> {
    let layout = OciLayout::open(&config.layout.path)?;
    let checked = layout.verify()?;
    let tags = layout.tags()?;
    info!(
        blobs = checked,
        tags = tags.len(),
        layout = %layout.root().display(),
        "layout verified"
    );
    Ok(())
}
