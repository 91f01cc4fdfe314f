use std::process::Command;

fn main() {
    let is_dirty = Command::new("git")
        .args(["diff-index", "--quiet", "HEAD", "--"])
        .status()
        .map(|status| !status.success())
        .unwrap_or(false);

    // packagers can pin the revision, CI provides it through GITHUB_SHA
    let git_rev = std::env::var("NTP_SYNCD_GIT_REV")
        .or_else(|_| std::env::var("GITHUB_SHA"))
        .ok()
        .or_else(|| {
            run_command("git", &["rev-parse", "HEAD"])
                .ok()
                .map(|rev| if is_dirty { format!("{rev}-dirty") } else { rev })
        });

    let git_date = match (std::env::var("NTP_SYNCD_GIT_DATE").ok(), &git_rev) {
        (Some(date), _) => Some(date),
        (None, Some(_)) if is_dirty => run_command("date", &["-u", "+%Y-%m-%d"]).ok(),
        (None, Some(hash)) => run_command(
            "git",
            &["show", "-s", "--date=format:%Y-%m-%d", "--format=%cd", hash, "--"],
        )
        .ok(),
        (None, None) => None,
    };

    println!(
        "cargo:rustc-env=NTP_SYNCD_GIT_REV={}",
        git_rev.unwrap_or_else(|| "-".to_owned())
    );
    println!(
        "cargo:rustc-env=NTP_SYNCD_GIT_DATE={}",
        git_date.unwrap_or_else(|| "-".to_owned())
    );
    println!("cargo:rerun-if-changed=.git/HEAD");
}

fn run_command(cmd: &str, args: &[&str]) -> std::io::Result<String> {
    let output = Command::new(cmd).args(args).output()?;
    String::from_utf8(output.stdout)
        .map(|data| data.trim().to_owned())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
