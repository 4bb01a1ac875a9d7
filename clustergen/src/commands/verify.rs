use anyhow::Result;
use common::{exit, progress::GREEN_TICK};
use pki::verify::verify_dir;
use tracing::info;

use crate::args::VerifyArgs;

pub async fn verify(args: &VerifyArgs) -> Result<()> {
    let verified = match verify_dir(&args.pki_dir) {
        Ok(v) => v,
        Err(err) => exit!(
            err,
            "PKI in {} did not verify",
            args.pki_dir.display()
        ),
    };

    for cert in &verified {
        info!(file = %cert.file, serial = %cert.info.serial, "verified");
        println!(
            "{} {}\n    subject: {}\n    issuer:  {} ({})\n    SANs:    {}\n    expires: {}",
            GREEN_TICK.to_string(),
            cert.file,
            cert.info.subject,
            cert.info.issuer,
            cert.authority,
            if cert.info.alt_names.is_empty() {
                "-".to_owned()
            } else {
                cert.info.alt_names.join(", ")
            },
            cert.info.not_after,
        );
    }
    println!(
        "{} certificates in {} chain to their authorities",
        verified.len(),
        args.pki_dir.display()
    );
    Ok(())
}
