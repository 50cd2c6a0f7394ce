use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::forward::ForwardSpec;

/// One `[[forwards]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardConf {
    pub name: String,

    #[serde(alias = "type")]
    pub kind: String,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    #[serde(default)]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub remote: String,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_hostname: Option<String>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_hostname: Option<String>,

    #[serde(default)]
    pub disable_proxy: bool,

    #[serde(default)]
    pub ports: Vec<String>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl From<ForwardConf> for ForwardSpec {
    fn from(conf: ForwardConf) -> Self {
        let ForwardConf {
            name,
            kind,
            context,
            namespace,
            labels,
            remote,
            hostname,
            proxy_hostname,
            forward_hostname,
            disable_proxy,
            ports,
            args,
        } = conf;

        ForwardSpec {
            name,
            kind,
            context: context.filter(|c| !c.is_empty()),
            namespace,
            labels,
            remote,
            hostname,
            proxy_hostname,
            forward_hostname,
            disable_proxy,
            ports,
            args,
        }
    }
}
