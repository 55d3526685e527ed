//! SSH credential translation through static port forwards.

use std::net::Ipv4Addr;

use anyhow::Result;
use rackalloc_networking::{SshCredentials, SshPortForwarding};

use super::CredentialTranslator;
use crate::hosts::Host;

/// Points clients at `public_ip:(base_port + host index)`.
#[derive(Debug, Clone)]
pub struct PortForwardTranslator {
    forwarding: SshPortForwarding,
}

impl PortForwardTranslator {
    pub fn new(public_ip: Ipv4Addr) -> Self {
        Self {
            forwarding: SshPortForwarding::new(public_ip),
        }
    }
}

impl CredentialTranslator for PortForwardTranslator {
    fn translate(&self, host: &Host) -> Result<SshCredentials> {
        Ok(self.forwarding.translate(host.index.value(), &host.ssh)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::host::tests::test_host;

    #[test]
    fn test_translates_to_public_endpoint() {
        let translator = PortForwardTranslator::new(Ipv4Addr::new(10, 0, 0, 5));
        let creds = translator.translate(&test_host(7)).unwrap();
        assert_eq!(creds.hostname, "10.0.0.5");
        assert_eq!(creds.port, 2007);
        assert_eq!(creds.username, "root");
        assert_eq!(creds.password, "rackattack");
    }
}
