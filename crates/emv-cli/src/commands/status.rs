use anyhow::Context;
use emv_common::StatusWord;

pub fn cmd_status(input: &str) -> anyhow::Result<()> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let sw: StatusWord = compact
        .parse()
        .with_context(|| format!("{input} is not a status word (four hex digits)"))?;

    let class = if sw.is_success() {
        "success"
    } else if sw.is_warning() {
        "warning"
    } else if sw.is_known() {
        "error"
    } else {
        "non-standard"
    };
    println!("{sw}  {}  ({class})", sw.describe());
    Ok(())
}
