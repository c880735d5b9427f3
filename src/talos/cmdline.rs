//! Kernel command line builder

use std::fmt;

/// Ordered kernel command line arguments.
///
/// Keys keep the position of their first appearance; appending an existing
/// key adds another value for it (`key=a key=b`). A key with an empty value
/// renders bare, e.g. `slab_nomerge`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelCmdline {
    params: Vec<(String, Vec<String>)>,
}

impl KernelCmdline {
    /// Empty command line
    pub fn new() -> Self {
        Self::default()
    }

    /// Command line with Talos' kernel hardening defaults
    pub fn hardened() -> Self {
        let mut cmdline = Self::new();
        cmdline.append("page_poison", "1");
        cmdline.append("slab_nomerge", "");
        cmdline.append("slub_debug", "P");
        cmdline.append("pti", "on");
        cmdline
    }

    /// Append `key=value`
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();

        match self.params.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => self.params.push((key, vec![value])),
        }

        self
    }

    /// One string per argument, in order
    pub fn strings(&self) -> Vec<String> {
        self.params
            .iter()
            .flat_map(|(key, values)| {
                values.iter().map(move |value| {
                    if value.is_empty() {
                        key.clone()
                    } else {
                        format!("{key}={value}")
                    }
                })
            })
            .collect()
    }
}

impl fmt::Display for KernelCmdline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.strings().join(" "))
    }
}
