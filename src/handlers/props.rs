//! PROPFIND and PROPPATCH.

use super::{AppState, DavRequest, Depth, child_prefix};
use crate::{
    errors::AppError,
    models::{
        object::RESOURCETYPE_KEY,
        property::{PropertySet, is_xml_name, xml_escape},
        proppatch::PropPatch,
    },
    services::{GetOptions, GetOutcome, PutOptions, listing::list_all},
};
use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use futures::TryStreamExt;
use std::pin::pin;

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="utf-8"?>"#;

pub async fn handle_propfind(state: &AppState, req: DavRequest) -> Result<Response, AppError> {
    let key = req.key();
    let mut entries: Vec<(String, PropertySet)> = Vec::new();

    let is_collection = if key.is_empty() {
        entries.push(("/".to_string(), PropertySet::root()));
        true
    } else {
        let record = state
            .store
            .head(&key)
            .await?
            .ok_or_else(AppError::not_found)?;
        entries.push((record.href(), PropertySet::from_record(&record)));
        record.is_collection()
    };

    if is_collection {
        let depth = Depth::from_headers(&req.headers).ok_or_else(AppError::forbidden)?;
        tracing::debug!(key = %key, ?depth, "propfind on collection");
        if depth != Depth::Zero {
            let recursive = depth == Depth::Infinity;
            let mut children = pin!(list_all(state.store.clone(), child_prefix(&key), recursive));
            while let Some(child) = children.try_next().await? {
                entries.push((child.href(), PropertySet::from_record(&child)));
            }
        }
    }

    let mut xml = format!(r#"{XML_DECLARATION}<multistatus xmlns="DAV:">"#);
    for (href, props) in &entries {
        xml.push_str(&format!(
            "<response><href>{}</href><propstat><prop>{}</prop><status>HTTP/1.1 200 OK</status></propstat></response>",
            xml_escape(href),
            props.to_xml()
        ));
    }
    xml.push_str("</multistatus>");
    Ok(multistatus(xml))
}

/// Apply a `<propertyupdate>` to the custom metadata of one object.
///
/// The store cannot update metadata in place, so the object is rewritten
/// with its current body.
pub async fn handle_proppatch(state: &AppState, req: DavRequest) -> Result<Response, AppError> {
    let key = req.key();
    let body = axum::body::to_bytes(req.body, usize::MAX)
        .await
        .map_err(|_| AppError::bad_request())?;
    let patch = PropPatch::parse(&body).map_err(|err| {
        tracing::debug!(key = %key, error = %err, "rejecting propertyupdate");
        AppError::bad_request()
    })?;

    let object = match state.store.get(&key, GetOptions::default()).await? {
        GetOutcome::Found(object) => object,
        GetOutcome::Absent | GetOutcome::PreconditionFailed(_) => {
            return Err(AppError::not_found());
        }
    };

    let mut custom = object.record.custom_metadata.clone();
    let mut applied: Vec<String> = Vec::new();
    let mut refused: Vec<String> = Vec::new();
    for (name, value) in patch.set {
        if name == RESOURCETYPE_KEY {
            note(&mut refused, name);
        } else {
            custom.insert(name.clone(), value);
            note(&mut applied, name);
        }
    }
    for name in patch.remove {
        if name == RESOURCETYPE_KEY {
            note(&mut refused, name);
        } else {
            custom.remove(&name);
            note(&mut applied, name);
        }
    }

    let href = object.record.href();
    if !applied.is_empty() {
        let opts = PutOptions {
            only_if: None,
            http_metadata: object.record.http_metadata.clone(),
            custom_metadata: custom,
        };
        state.store.put(&key, object.body, opts).await?;
        tracing::info!(key = %key, changed = applied.len(), "updated properties");
    }

    let mut xml = format!(
        r#"{XML_DECLARATION}<multistatus xmlns="DAV:"><response><href>{}</href>"#,
        xml_escape(&href)
    );
    xml.push_str(&propstat(&applied, "HTTP/1.1 200 OK"));
    xml.push_str(&propstat(&refused, "HTTP/1.1 403 Forbidden"));
    xml.push_str("</response></multistatus>");
    Ok(multistatus(xml))
}

fn note(names: &mut Vec<String>, name: String) {
    if !names.contains(&name) {
        names.push(name);
    }
}

fn propstat(names: &[String], status: &str) -> String {
    if names.is_empty() {
        return String::new();
    }
    let props: String = names
        .iter()
        .filter(|name| is_xml_name(name))
        .map(|name| format!("<{name} />"))
        .collect();
    format!("<propstat><prop>{props}</prop><status>{status}</status></propstat>")
}

fn multistatus(xml: String) -> Response {
    let mut response = Response::new(Body::from(xml));
    *response.status_mut() = StatusCode::MULTI_STATUS;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml; charset=utf-8"),
    );
    response
}
