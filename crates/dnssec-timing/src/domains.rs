use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

use dns_types::protocol::types::*;

/// A list of domains, one per line, read as it is needed.  Blank
/// lines and lines starting with `#` are skipped, names are lowercased
/// and made fully qualified.  Lines which are not domain names are
/// logged and skipped.
pub struct DomainList<R> {
    lines: Lines<R>,
    line_number: usize,
}

impl<R: AsyncBufRead + Unpin> DomainList<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_number: 0,
        }
    }

    /// The next domain in the list, or `None` at the end.
    ///
    /// # Errors
    ///
    /// If the reader fails.
    pub async fn next_domain(&mut self) -> io::Result<Option<DomainName>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_number += 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match DomainName::from_dotted_string(line) {
                Some(domain) => return Ok(Some(domain)),
                None => tracing::warn!(
                    line_number = self.line_number,
                    %line,
                    "skipping invalid domain name"
                ),
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, BufReader};

    use dns_types::protocol::types::test_util::*;

    use super::*;

    async fn read_all(list: &[u8]) -> Vec<DomainName> {
        let mut list = DomainList::new(list);
        let mut domains = Vec::new();
        while let Some(domain) = list.next_domain().await.unwrap() {
            domains.push(domain);
        }
        domains
    }

    #[tokio::test]
    async fn skips_comments_and_blanks() {
        let list = b"# ccTLDs\nse\n\n  NU.  \n#nu.\nexample.com.\n";

        assert_eq!(
            vec![domain("se."), domain("nu."), domain("example.com.")],
            read_all(&list[..]).await
        );
    }

    #[tokio::test]
    async fn skips_invalid_names() {
        let list = b"se.\nbad..name\nnu\n";

        assert_eq!(
            vec![domain("se."), domain("nu.")],
            read_all(&list[..]).await
        );
    }

    #[tokio::test]
    async fn yields_each_domain_as_it_arrives() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut list = DomainList::new(BufReader::new(reader));

        writer.write_all(b"se.\n").await.unwrap();
        assert_eq!(Some(domain("se.")), list.next_domain().await.unwrap());

        writer.write_all(b"# more\nnu.\n").await.unwrap();
        drop(writer);
        assert_eq!(Some(domain("nu.")), list.next_domain().await.unwrap());
        assert_eq!(None, list.next_domain().await.unwrap());
    }

    #[tokio::test]
    async fn empty_list() {
        assert!(read_all(b"").await.is_empty());
    }
}
