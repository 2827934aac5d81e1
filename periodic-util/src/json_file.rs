// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::prelude::*;
use std::path::Path;

/// Split a commented JSON file into its leading comment block and the body.
/// Comment lines are blanked in the body so that parse errors still point at
/// the right line.
fn read_json<P: AsRef<Path>>(path: P) -> Result<(String, String)> {
    let mut f = fs::OpenOptions::new().read(true).open(path)?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    Ok(split_json(&buf))
}

fn split_json(buf: &str) -> (String, String) {
    let mut preamble = String::new();
    let mut body = String::new();
    let mut seen_body = false;

    for line in buf.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("//") || trimmed.starts_with("#") {
            if !seen_body {
                preamble = preamble + line + "\n";
            }
            body = body + "\n";
        } else {
            seen_body = true;
            body = body + line + "\n"
        }
    }
    (preamble, body)
}

pub trait JsonLoad
where
    Self: DeserializeOwned,
{
    fn loaded(&mut self) -> Result<()> {
        Ok(())
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let (_, body) = read_json(path).with_context(|| format!("reading {:?}", path))?;
        let mut data = serde_json::from_str::<Self>(&body)
            .with_context(|| format!("parsing {:?}", path))?;
        data.loaded()?;
        Ok(data)
    }

    fn from_json_str(input: &str) -> Result<Self> {
        let (_, body) = split_json(input);
        let mut data = serde_json::from_str::<Self>(&body)?;
        data.loaded()?;
        Ok(data)
    }
}

pub trait JsonSave
where
    Self: Serialize,
{
    fn preamble() -> Option<String> {
        None
    }

    fn as_json(&self) -> Result<String> {
        let mut serialized = serde_json::to_string_pretty(&self)?;
        if !serialized.ends_with("\n") {
            serialized += "\n";
        }
        match Self::preamble() {
            Some(pre) => Ok(pre + &serialized),
            None => Ok(serialized),
        }
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("opening {:?}", path))?;
        f.write_all(self.as_json()?.as_ref())?;
        Ok(())
    }
}
