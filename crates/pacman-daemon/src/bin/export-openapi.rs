use std::{env, fs, path::Path};

use anyhow::{Context, Result};
use pacman_daemon::server::docs::ApiDoc;
use utoipa::OpenApi;

fn main() -> Result<()> {
    let output = env::args().nth(1);
    let json = ApiDoc::openapi()
        .to_pretty_json()
        .context("failed to serialise OpenAPI")?;

    match output {
        Some(path) => {
            let path = Path::new(&path);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create directory for {}", path.display())
                })?;
            }
            fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        }
        None => println!("{json}"),
    }

    Ok(())
}
