/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::LockScope;

fn emit(w: &mut Writer<Vec<u8>>, event: Event<'_>) -> io::Result<()> {
    w.write_event(event).map_err(io::Error::other)
}

fn dav_root(name: &'static str) -> BytesStart<'static> {
    let mut e = BytesStart::new(name);
    e.push_attribute(("xmlns:D", "DAV:"));
    e
}

/// PROPFIND request body: the named properties, or allprop when none are
/// given. Property names are taken to live in the DAV: namespace.
pub(crate) fn propfind_body(props: Option<&[&str]>) -> io::Result<Vec<u8>> {
    let mut w = Writer::new(Vec::new());
    emit(&mut w, Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    emit(&mut w, Event::Start(dav_root("D:propfind")))?;
    match props {
        None => emit(&mut w, Event::Empty(BytesStart::new("D:allprop")))?,
        Some(names) => {
            emit(&mut w, Event::Start(BytesStart::new("D:prop")))?;
            for name in names {
                emit(&mut w, Event::Empty(BytesStart::new(format!("D:{name}"))))?;
            }
            emit(&mut w, Event::End(BytesEnd::new("D:prop")))?;
        }
    }
    emit(&mut w, Event::End(BytesEnd::new("D:propfind")))?;
    Ok(w.into_inner())
}

/// LOCK request body: lockinfo with scope, write type and an owner string.
pub(crate) fn lock_body(scope: LockScope, owner: &str) -> io::Result<Vec<u8>> {
    let mut w = Writer::new(Vec::new());
    emit(&mut w, Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    emit(&mut w, Event::Start(dav_root("D:lockinfo")))?;
    emit(&mut w, Event::Start(BytesStart::new("D:lockscope")))?;
    let scope_tag = match scope {
        LockScope::Exclusive => "D:exclusive",
        LockScope::Shared => "D:shared",
    };
    emit(&mut w, Event::Empty(BytesStart::new(scope_tag)))?;
    emit(&mut w, Event::End(BytesEnd::new("D:lockscope")))?;
    emit(&mut w, Event::Start(BytesStart::new("D:locktype")))?;
    emit(&mut w, Event::Empty(BytesStart::new("D:write")))?;
    emit(&mut w, Event::End(BytesEnd::new("D:locktype")))?;
    if !owner.is_empty() {
        emit(&mut w, Event::Start(BytesStart::new("D:owner")))?;
        emit(&mut w, Event::Text(BytesText::new(owner)))?;
        emit(&mut w, Event::End(BytesEnd::new("D:owner")))?;
    }
    emit(&mut w, Event::End(BytesEnd::new("D:lockinfo")))?;
    Ok(w.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propfind_allprop() {
        let body = propfind_body(None).unwrap();
        let s = String::from_utf8(body).unwrap();
        assert!(s.contains("<D:propfind xmlns:D=\"DAV:\">"));
        assert!(s.contains("<D:allprop/>"));
    }

    #[test]
    fn propfind_named() {
        let body = propfind_body(Some(&["getcontentlength", "resourcetype"])).unwrap();
        let s = String::from_utf8(body).unwrap();
        assert!(s.contains("<D:getcontentlength/>"));
        assert!(s.contains("<D:resourcetype/>"));
        assert!(!s.contains("allprop"));
    }

    #[test]
    fn lock_escapes_owner() {
        let body = lock_body(LockScope::Exclusive, "me <here>").unwrap();
        let s = String::from_utf8(body).unwrap();
        assert!(s.contains("<D:exclusive/>"));
        assert!(s.contains("<D:write/>"));
        assert!(s.contains("me &lt;here&gt;"));
    }
}
