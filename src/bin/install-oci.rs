use anyhow::{bail, Result};
use tracing::info;

use flatpak_oci_fixtures::{
    logging, preflight, Arch, ContentItem, Deployer, FixturesConfig, FlatpakCli, Installer,
    OciLayout, RefKind,
};

fn usage() -> &'static str {
    "Usage:\n  install-oci <REF> [--arch <amd64|arm64>] [--run]\n\n  REF is a tag in the layout (e.g. oci-net.fishsoup.Hello) or a bare item id."
}

#[derive(Debug, PartialEq, Eq)]
struct InstallArgs {
    reference: String,
    arch: Option<Arch>,
    run: bool,
}

fn parse_args(args: &[String]) -> Result<InstallArgs> {
    let mut reference = None;
    let mut arch = None;
    let mut run = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--arch" => {
                let Some(value) = iter.next() else {
                    bail!("--arch needs a value\n{}", usage());
                };
                arch = Some(value.parse::<Arch>()?);
            }
            "--run" => run = true,
            flag if flag.starts_with('-') => bail!("unknown option '{}'\n{}", flag, usage()),
            positional => {
                if reference.replace(positional.to_string()).is_some() {
                    bail!("expected exactly one REF\n{}", usage());
                }
            }
        }
    }

    let Some(reference) = reference else {
        bail!(usage());
    };
    Ok(InstallArgs {
        reference,
        arch,
        run,
    })
}

/// Tag to resolve for `reference`: bare item ids map to their tag.
fn tag_for(reference: &str) -> String {
    ContentItem::by_name(reference)
        .map(|item| item.tag())
        .unwrap_or_else(|| reference.to_string())
}

fn main() -> Result<()> {
    logging::init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&args)?;
    let config = FixturesConfig::load()?;

    preflight::check_install_tools()?;

    let arch = match args.arch {
        Some(arch) => arch,
        None => Arch::host()?,
    };
    let layout = OciLayout::open(&config.layout.path)?;
    let deployer = FlatpakCli::new(&config.install.remote, &config.install.repo);
    info!(remote = deployer.remote(), repo = %deployer.repo().display(), "using local remote");

    let installer = Installer::new(layout, deployer);
    let installed = installer.install(&tag_for(&args.reference), arch)?;

    if args.run {
        if installed.flatpak_ref.kind != RefKind::App {
            bail!("--run: {} is not an application", installed.flatpak_ref);
        }
        installer.deployer().run(&installed.flatpak_ref.id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_reference_and_flags() {
        let parsed = parse_args(&args(&["--arch", "aarch64", "oci-net.fishsoup.Hello", "--run"]))
            .unwrap();
        assert_eq!(
            parsed,
            InstallArgs {
                reference: "oci-net.fishsoup.Hello".into(),
                arch: Some(Arch::Arm64),
                run: true,
            }
        );
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["a", "b"])).is_err());
        assert!(parse_args(&args(&["a", "--arch"])).is_err());
        assert!(parse_args(&args(&["a", "--arch", "riscv64"])).is_err());
        assert!(parse_args(&args(&["a", "--force"])).is_err());
    }

    #[test]
    fn bare_ids_map_to_tags() {
        assert_eq!(tag_for("net.fishsoup.Hello"), "oci-net.fishsoup.Hello");
        assert_eq!(tag_for("oci-net.fishsoup.Hello"), "oci-net.fishsoup.Hello");
        assert_eq!(tag_for("custom-tag"), "custom-tag");
    }
}
