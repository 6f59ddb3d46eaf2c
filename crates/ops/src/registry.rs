//! Static operation registry: key, display name, category and manifest source.

use meshd_core::{OpCategory, SupportedOperation};

pub const LINKERD_INSTALL: &str = "linkerd_install";
pub const INSTALL_BOOKS_APP: &str = "install_books_app";
pub const INSTALL_HTTP_BIN: &str = "install_http_bin";
pub const INSTALL_ISTIO_BOOK_INFO: &str = "install_istio_book_info";
pub const INSTALL_EMOJIVOTO: &str = "install_emojivoto";
pub const CUSTOM: &str = "custom";

/// Where an operation's manifest comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestSource {
    /// Generated by the external installer.
    Installer,
    /// Built-in template rendered with namespace and requester.
    Template(&'static str),
    /// Remote manifest fetched once and cached under `cache_name`.
    Remote { url: &'static str, cache_name: &'static str },
    /// The request body.
    RequestBody,
}

/// Sample application deployed by an operation; names its events and port lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleApp {
    pub app_name: &'static str,
    pub service: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub key: &'static str,
    pub display_name: &'static str,
    pub category: OpCategory,
    pub source: ManifestSource,
    pub sample: Option<SampleApp>,
}

pub static DESCRIPTORS: &[Descriptor] = &[
    Descriptor {
        key: LINKERD_INSTALL,
        display_name: "Latest version of Linkerd",
        category: OpCategory::Install,
        source: ManifestSource::Installer,
        sample: None,
    },
    Descriptor {
        key: INSTALL_BOOKS_APP,
        display_name: "Books Application",
        category: OpCategory::SampleApplication,
        source: ManifestSource::Remote { url: "https://run.linkerd.io/booksapp.yml", cache_name: "booksapp.yml" },
        sample: Some(SampleApp { app_name: "Linkerd Books App", service: "webapp" }),
    },
    Descriptor {
        key: INSTALL_HTTP_BIN,
        display_name: "HTTPbin Application",
        category: OpCategory::SampleApplication,
        source: ManifestSource::Template("httpbin.yaml"),
        sample: Some(SampleApp { app_name: "HTTP Bin App", service: "httpbin" }),
    },
    Descriptor {
        key: INSTALL_ISTIO_BOOK_INFO,
        display_name: "Istio BookInfo Application",
        category: OpCategory::SampleApplication,
        source: ManifestSource::Template("bookinfo.yaml"),
        sample: Some(SampleApp { app_name: "Istio canonical Book Info App", service: "productpage" }),
    },
    Descriptor {
        key: INSTALL_EMOJIVOTO,
        display_name: "Emojivoto Application",
        category: OpCategory::SampleApplication,
        source: ManifestSource::Remote { url: "https://run.linkerd.io/emojivoto.yml", cache_name: "emojivoto.yml" },
        sample: Some(SampleApp { app_name: "Emojivoto App", service: "web-svc" }),
    },
    Descriptor {
        key: CUSTOM,
        display_name: "Custom YAML",
        category: OpCategory::Custom,
        source: ManifestSource::RequestBody,
        sample: None,
    },
];

pub fn descriptor(key: &str) -> Option<&'static Descriptor> { DESCRIPTORS.iter().find(|d| d.key == key) }

/// Registry entries in table order.
pub fn supported_operations() -> Vec<SupportedOperation> {
    DESCRIPTORS
        .iter()
        .map(|d| SupportedOperation { key: d.key.to_string(), display_name: d.display_name.to_string(), category: d.category })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn keys_are_unique_and_listed() {
        let keys: HashSet<&str> = DESCRIPTORS.iter().map(|d| d.key).collect();
        assert_eq!(keys.len(), DESCRIPTORS.len());
        let listed: HashSet<String> = supported_operations().into_iter().map(|s| s.key).collect();
        assert_eq!(listed.len(), keys.len());
        assert!(keys.iter().all(|k| listed.contains(*k)));
    }

    #[test]
    fn sample_apps_carry_a_service() {
        for d in DESCRIPTORS {
            assert_eq!(d.sample.is_some(), d.category == OpCategory::SampleApplication, "{}", d.key);
        }
        assert_eq!(descriptor(INSTALL_EMOJIVOTO).and_then(|d| d.sample).map(|s| s.service), Some("web-svc"));
        assert!(descriptor("install_everything").is_none());
    }
}
