// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::io::{BufRead, Write};

use async_trait::async_trait;
use experiment::{Error, Result};
use log::info;
use xml::reader::{ParserConfig, XmlEvent};

///
/// Directory lookup for PlanetLab-style slices: given a slice name, report the
/// hostnames currently assigned to it. A trait so tests (and future directory
/// services) can stand in for the XML-RPC API.
///
#[async_trait]
pub trait SliceDirectory: Send + Sync {
    async fn slice_hostnames(
        &self,
        api_url: &str,
        slice: &str,
        credentials: &SliceCredentials,
    ) -> Result<Vec<String>>;
}

pub struct SliceCredentials {
    pub user: String,
    pub password: String,
}

impl SliceCredentials {
    ///
    /// A declared password is used as-is. Without one we ask on the terminal,
    /// unless interactive prompts are disabled, which makes the missing
    /// password a setup failure.
    ///
    pub fn obtain(user: String, password: Option<String>, batch: bool) -> Result<SliceCredentials> {
        let password = match password {
            Some(password) => password,
            None if batch => {
                return Err(Error::setup(format!(
                    "planetlab password for '{user}' required, but prompts are disabled (--batch)"
                )));
            }
            None => prompt(&format!("PlanetLab password for {user}: "))?,
        };
        Ok(SliceCredentials { user, password })
    }
}

fn prompt(message: &str) -> Result<String> {
    let mut stderr = std::io::stderr();
    stderr
        .write_all(message.as_bytes())
        .and_then(|()| stderr.flush())
        .map_err(|e| Error::setup(format!("could not prompt for password: {e}")))?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| Error::setup(format!("could not read password: {e}")))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

///
/// The real PlanetLab Central API: XML-RPC over HTTP(S), using the
/// `GetSlices` and `GetNodes` calls exactly as the reference API documents
/// them.
///
pub struct PlanetLabDirectory {
    client: reqwest::Client,
}

impl PlanetLabDirectory {
    pub fn new() -> PlanetLabDirectory {
        PlanetLabDirectory {
            client: reqwest::Client::new(),
        }
    }

    async fn call(&self, api_url: &str, body: String) -> Result<String> {
        let response = self
            .client
            .post(api_url)
            .header("content-type", "text/xml")
            .body(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::setup(format!("PlanetLab API call failed: {e}")))?;
        response
            .text()
            .await
            .map_err(|e| Error::setup(format!("PlanetLab API call failed: {e}")))
    }
}

#[async_trait]
impl SliceDirectory for PlanetLabDirectory {
    async fn slice_hostnames(
        &self,
        api_url: &str,
        slice: &str,
        credentials: &SliceCredentials,
    ) -> Result<Vec<String>> {
        info!("making RPC call to planetlab");
        let auth = auth_struct(credentials);

        let slices_call = method_call(
            "GetSlices",
            &[
                auth.clone(),
                format!("<array><data><value><string>{}</string></value></data></array>", xml_escape(slice)),
                "<array><data><value><string>node_ids</string></value></data></array>".to_owned(),
            ],
        );
        let response = self.call(api_url, slices_call).await?;
        let node_ids = member_values(&response, "node_ids", &["int", "i4"])?;

        let id_values = node_ids
            .iter()
            .map(|id| format!("<value><int>{id}</int></value>"))
            .collect::<Vec<_>>()
            .concat();
        let nodes_call = method_call(
            "GetNodes",
            &[
                auth,
                format!("<array><data>{id_values}</data></array>"),
                "<array><data><value><string>hostname</string></value></data></array>".to_owned(),
            ],
        );
        let response = self.call(api_url, nodes_call).await?;
        let hostnames = member_values(&response, "hostname", &["string"])?;
        info!("got response from planetlab");
        Ok(hostnames)
    }
}

fn method_call(method: &str, params: &[String]) -> String {
    let mut body = String::from("<?xml version=\"1.0\"?><methodCall>");
    body.push_str(&format!("<methodName>{method}</methodName><params>"));
    for param in params {
        body.push_str("<param><value>");
        body.push_str(param);
        body.push_str("</value></param>");
    }
    body.push_str("</params></methodCall>");
    body
}

fn auth_struct(credentials: &SliceCredentials) -> String {
    format!(
        "<struct>\
         <member><name>Username</name><value><string>{}</string></value></member>\
         <member><name>AuthString</name><value><string>{}</string></value></member>\
         <member><name>AuthMethod</name><value><string>password</string></value></member>\
         </struct>",
        xml_escape(&credentials.user),
        xml_escape(&credentials.password),
    )
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

///
/// Scrape the values of one named struct member out of an XML-RPC response:
/// every text node in an element tagged with one of `kinds` that follows a
/// `<name>` equal to `member`. A `<fault>` element anywhere fails the call.
///
fn member_values(response: &str, member: &str, kinds: &[&str]) -> Result<Vec<String>> {
    let reader = ParserConfig::new()
        .trim_whitespace(true)
        .cdata_to_characters(true)
        .create_reader(response.as_bytes());

    let mut values = Vec::new();
    let mut tags: Vec<String> = Vec::new();
    let mut current_member: Option<String> = None;

    for event in reader {
        let event = event
            .map_err(|e| Error::setup(format!("malformed PlanetLab API response: {e}")))?;
        match event {
            XmlEvent::StartElement { name, .. } => {
                if name.local_name == "fault" {
                    return Err(Error::setup("PlanetLab API call failed".to_owned()));
                }
                tags.push(name.local_name);
            }
            XmlEvent::EndElement { .. } => {
                tags.pop();
            }
            XmlEvent::Characters(text) => match tags.last().map(String::as_str) {
                Some("name") => current_member = Some(text),
                Some(tag) => {
                    if kinds.contains(&tag) && current_member.as_deref() == Some(member) {
                        values.push(text);
                    }
                }
                None => (),
            },
            _ => (),
        }
    }
    Ok(values)
}

#[cfg(test)]
mod planetlab_tests {
    use super::member_values;

    const GET_SLICES_RESPONSE: &str = r#"<?xml version="1.0"?>
      <methodResponse><params><param><value><array><data><value><struct>
        <member><name>slice_id</name><value><int>7</int></value></member>
        <member><name>node_ids</name><value><array><data>
          <value><int>11</int></value>
          <value><int>12</int></value>
        </data></array></value></member>
      </struct></value></data></array></value></param></params></methodResponse>"#;

    #[test]
    fn extracts_named_int_members() {
        let ids = member_values(GET_SLICES_RESPONSE, "node_ids", &["int", "i4"]).unwrap();
        assert_eq!(ids, vec!["11", "12"]);
    }

    #[test]
    fn ignores_other_members() {
        let ids = member_values(GET_SLICES_RESPONSE, "slice_id", &["int"]).unwrap();
        assert_eq!(ids, vec!["7"]);
    }

    #[test]
    fn fault_is_a_setup_error() {
        let response = r#"<methodResponse><fault><value><struct>
          <member><name>faultCode</name><value><int>103</int></value></member>
        </struct></value></fault></methodResponse>"#;
        assert!(member_values(response, "node_ids", &["int"]).is_err());
    }
}
