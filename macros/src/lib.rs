use std::path::PathBuf;

use proc_macro::TokenStream;
use proc_macro2::TokenStream as Ts;
use quote::{format_ident, quote};
use serde::Deserialize;

#[derive(Deserialize)]
struct Manifest {
    template: Vec<Entry>,
}

#[derive(Deserialize)]
struct Entry {
    name: String,
    file: String,
}

fn fail(msg: String) -> TokenStream {
    quote! { compile_error!(#msg); }.into()
}

/// Embeds every template listed in `templates/manifest.toml` of the calling
/// crate. Expands to a `TEMPLATES` table of `(name, source)` pairs plus one
/// `&str` constant per template name, e.g. `cloud-init.yaml` becomes
/// `CLOUD_INIT_YAML`.
#[proc_macro]
pub fn include_templates(_: TokenStream) -> TokenStream {
    let root = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir).join("templates"),
        Err(e) => return fail(format!("CARGO_MANIFEST_DIR not set: {e}")),
    };
    let manifest_path = root.join("manifest.toml");
    let manifest = match std::fs::read_to_string(&manifest_path) {
        Ok(m) => m,
        Err(e) => return fail(format!("cannot read {}: {e}", manifest_path.display())),
    };
    let manifest: Manifest = match toml::from_str(&manifest) {
        Ok(m) => m,
        Err(e) => return fail(format!("bad {}: {e}", manifest_path.display())),
    };

    let mut names = Vec::new();
    let mut sources = Vec::new();
    let mut stream = Ts::new();
    for t in manifest.template {
        let path = root.join(&t.file);
        if !path.is_file() {
            return fail(format!("template {} not found at {}", t.name, path.display()));
        }
        let path = path.display().to_string();
        let ident: String = t
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        let ident = format_ident!("{}", ident);
        let name = t.name;

        stream.extend::<Ts>(quote! {
            pub const #ident: &str = #name;
        });
        names.push(name);
        sources.push(path);
    }

    stream.extend::<Ts>(quote! {
        pub const TEMPLATES: &[(&str, &str)] = &[#((#names, include_str!(#sources)),)*];
    });

    stream.into()
}
