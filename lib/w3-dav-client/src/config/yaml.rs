/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow};
use url::Url;
use yaml_rust::Yaml;

use super::{HttpCacheConfig, HttpClientConfig};

fn as_str(v: &Yaml, key: &str) -> anyhow::Result<String> {
    v.as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("invalid string value for key {key}"))
}

fn as_secs(v: &Yaml, key: &str) -> anyhow::Result<u64> {
    v.as_i64()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| anyhow!("invalid seconds value for key {key}"))
}

impl HttpCacheConfig {
    pub fn parse_yaml(value: &Yaml) -> anyhow::Result<Self> {
        let Yaml::Hash(map) = value else {
            return Err(anyhow!("invalid yaml type"));
        };
        let mut dir = None;
        let mut config = HttpCacheConfig::new(PathBuf::new());
        for (k, v) in map {
            let key = k.as_str().ok_or_else(|| anyhow!("invalid key type"))?;
            match key {
                "dir" | "directory" => dir = Some(PathBuf::from(as_str(v, key)?)),
                "max_age" => {
                    config.max_age = v.as_i64().ok_or_else(|| anyhow!("invalid max_age"))?;
                }
                "cleaner_socket" => {
                    config.cleaner_socket = Some(PathBuf::from(as_str(v, key)?));
                }
                _ => return Err(anyhow!("invalid key {key}")),
            }
        }
        config.dir = dir.ok_or_else(|| anyhow!("no cache dir set"))?;
        Ok(config)
    }
}

impl HttpClientConfig {
    pub fn parse_yaml(value: &Yaml) -> anyhow::Result<Self> {
        let Yaml::Hash(map) = value else {
            return Err(anyhow!("invalid yaml type"));
        };
        let mut config = HttpClientConfig::default();
        for (k, v) in map {
            let key = k.as_str().ok_or_else(|| anyhow!("invalid key type"))?;
            match key {
                "user_agent" => config.user_agent = Some(as_str(v, key)?),
                "accept" => config.accept = as_str(v, key)?,
                "accept_charsets" => config.accept_charsets = Some(as_str(v, key)?),
                "accept_languages" => config.accept_languages = Some(as_str(v, key)?),
                "proxy" => {
                    let s = as_str(v, key)?;
                    config.proxy =
                        Some(Url::parse(&s).context(format!("invalid proxy url {s}"))?);
                }
                "connect_timeout" => {
                    config.connect_timeout = Duration::from_secs(as_secs(v, key)?);
                }
                "response_timeout" => {
                    config.response_timeout = Duration::from_secs(as_secs(v, key)?);
                }
                "persistent_connections" => {
                    config.persistent_connections =
                        v.as_bool().ok_or_else(|| anyhow!("invalid bool for {key}"))?;
                }
                "allow_compressed" => {
                    config.allow_compressed =
                        v.as_bool().ok_or_else(|| anyhow!("invalid bool for {key}"))?;
                }
                "error_page" => {
                    config.prefer_error_page =
                        v.as_bool().ok_or_else(|| anyhow!("invalid bool for {key}"))?;
                }
                "max_redirects" => {
                    config.max_redirects = v
                        .as_i64()
                        .and_then(|n| usize::try_from(n).ok())
                        .ok_or_else(|| anyhow!("invalid max_redirects"))?;
                }
                "cache" => {
                    config.cache = Some(
                        HttpCacheConfig::parse_yaml(v).context("invalid cache config")?,
                    );
                }
                _ => return Err(anyhow!("invalid key {key}")),
            }
        }
        Ok(config)
    }
}
