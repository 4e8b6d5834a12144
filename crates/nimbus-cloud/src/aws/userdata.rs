//! First-boot bootstrap scripts for IaaS instances.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use nimbus_core::Platform;

/// Template parameters for instance bootstrap.
pub struct UserDataParams<'a> {
    pub control_plane_url: &'a str,
    pub api_key: &'a str,
    pub instance_id: &'a str,
    pub bot_package: &'a str,
    pub bot_version: &'a str,
}

/// Renders the platform-specific bootstrap script, base64-encoded as the
/// RunInstances user-data payload expects.
pub fn render(platform: Platform, params: &UserDataParams<'_>) -> String {
    let script = match platform {
        Platform::MacOs => macos_script(params),
        Platform::Windows => windows_script(params),
        Platform::Linux => linux_script(params),
    };
    BASE64.encode(script)
}

fn bot_run_lines(params: &UserDataParams<'_>) -> String {
    if params.bot_package.is_empty() {
        return String::new();
    }
    let version_flag = if params.bot_version.is_empty() {
        String::new()
    } else {
        format!(" --version \"{}\"", params.bot_version)
    };
    format!(
        "nimbus-agent install \"{pkg}\"{version_flag}\nnimbus-agent run \"{pkg}\" &\n",
        pkg = params.bot_package,
    )
}

fn linux_script(params: &UserDataParams<'_>) -> String {
    format!(
        r#"#!/bin/bash
set -euo pipefail

export NIMBUS_SERVER_URL="{url}"
export NIMBUS_API_KEY="{key}"
export NIMBUS_INSTANCE_ID="{id}"

if ! command -v python3 &>/dev/null; then
  apt-get update -qq && apt-get install -y -qq python3 python3-pip curl
fi

pip3 install --quiet nimbus-agent
{run}"#,
        url = params.control_plane_url,
        key = params.api_key,
        id = params.instance_id,
        run = bot_run_lines(params),
    )
}

fn macos_script(params: &UserDataParams<'_>) -> String {
    format!(
        r#"#!/bin/bash
set -euo pipefail

export NIMBUS_SERVER_URL="{url}"
export NIMBUS_API_KEY="{key}"
export NIMBUS_INSTANCE_ID="{id}"

# Enable Screen Sharing so the instance is reachable over VNC.
sudo /System/Library/CoreServices/RemoteManagement/ARDAgent.app/Contents/Resources/kickstart \
  -activate -configure -access -on -restart -agent -privs -all

pip3 install --quiet nimbus-agent
{run}"#,
        url = params.control_plane_url,
        key = params.api_key,
        id = params.instance_id,
        run = bot_run_lines(params),
    )
}

fn windows_script(params: &UserDataParams<'_>) -> String {
    let run = if params.bot_package.is_empty() {
        String::new()
    } else {
        let version_flag = if params.bot_version.is_empty() {
            String::new()
        } else {
            format!(", \"--version\", \"{}\"", params.bot_version)
        };
        format!(
            "pip install --quiet nimbus-agent\nnimbus-agent install \"{pkg}\"{version_flag}\nStart-Process -NoNewWindow -FilePath \"nimbus-agent\" -ArgumentList \"run\", \"{pkg}\"\n",
            pkg = params.bot_package,
        )
    };
    format!(
        r#"<powershell>
$ErrorActionPreference = "Stop"

[Environment]::SetEnvironmentVariable("NIMBUS_SERVER_URL", "{url}", "Machine")
[Environment]::SetEnvironmentVariable("NIMBUS_API_KEY", "{key}", "Machine")
[Environment]::SetEnvironmentVariable("NIMBUS_INSTANCE_ID", "{id}", "Machine")

if (-not (Get-Command python -ErrorAction SilentlyContinue)) {{
    Invoke-WebRequest -Uri "https://www.python.org/ftp/python/3.12.0/python-3.12.0-amd64.exe" -OutFile "$env:TEMP\python-installer.exe"
    Start-Process -Wait -FilePath "$env:TEMP\python-installer.exe" -ArgumentList "/quiet", "InstallAllUsers=1", "PrependPath=1"
    $env:PATH = [Environment]::GetEnvironmentVariable("PATH", "Machine")
}}

{run}</powershell>
"#,
        url = params.control_plane_url,
        key = params.api_key,
        id = params.instance_id,
        run = run,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> UserDataParams<'static> {
        UserDataParams {
            control_plane_url: "https://cp.example.com",
            api_key: "secret",
            instance_id: "i-123",
            bot_package: "crawler",
            bot_version: "1.2.0",
        }
    }

    fn decode(encoded: &str) -> String {
        String::from_utf8(BASE64.decode(encoded).unwrap()).unwrap()
    }

    #[test]
    fn linux_script_carries_identity_and_bot() {
        let script = decode(&render(Platform::Linux, &params()));
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("NIMBUS_INSTANCE_ID=\"i-123\""));
        assert!(script.contains("nimbus-agent install \"crawler\" --version \"1.2.0\""));
    }

    #[test]
    fn macos_script_enables_screen_sharing() {
        let script = decode(&render(Platform::MacOs, &params()));
        assert!(script.contains("kickstart"));
        assert!(script.contains("NIMBUS_SERVER_URL=\"https://cp.example.com\""));
    }

    #[test]
    fn windows_script_is_powershell_wrapped() {
        let script = decode(&render(Platform::Windows, &params()));
        assert!(script.starts_with("<powershell>"));
        assert!(script.trim_end().ends_with("</powershell>"));
        assert!(script.contains("NIMBUS_API_KEY"));
    }

    #[test]
    fn missing_bot_package_skips_run_lines() {
        let p = UserDataParams {
            bot_package: "",
            bot_version: "",
            ..params()
        };
        let script = decode(&render(Platform::Linux, &p));
        assert!(!script.contains("nimbus-agent install"));
    }
}
