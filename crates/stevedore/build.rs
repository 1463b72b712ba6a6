use anyhow::Result;
use vergen::EmitBuilder;

pub fn main() -> Result<()> {
    if EmitBuilder::builder().git_sha(true).emit().is_err() {
        // only the short git sha is used, so a fallback value is enough
        println!("cargo:rustc-env=VERGEN_GIT_SHA=unknown");
    }
    Ok(())
}
