//! Command safety validation.
//!
//! Rejects shell commands that are destructive, smuggle extra commands
//! through shell metacharacters, or launch full-screen interactive programs
//! that would hang a non-interactive session. Pipes and redirections are
//! allowed; `&&`/`||` chains are validated segment by segment.

/// Substrings that mark a command as destructive. Matched against the
/// lowercased command padded with one space on each side, so entries with a
/// leading or trailing space only match on word boundaries.
const DENYLIST: &[&str] = &[
    // filesystem wipes
    " rm -rf / ",
    " rm -rf /* ",
    " rm -rf ~ ",
    " rm -rf ~/ ",
    " rm -fr / ",
    " rm -rf /bin ",
    " rm -rf /boot ",
    " rm -rf /etc ",
    " rm -rf /home ",
    " rm -rf /lib ",
    " rm -rf /usr ",
    " rm -rf /var ",
    " rm --no-preserve-root",
    " find / -delete",
    " find / -exec rm",
    // raw devices and partitioning
    " dd if=",
    "of=/dev/sd",
    "of=/dev/nvme",
    "> /dev/sd",
    " mkfs",
    " fdisk ",
    " parted ",
    " wipefs ",
    " shred ",
    // credentials
    " passwd root",
    " chpasswd",
    " usermod -p",
    "> /etc/passwd",
    "> /etc/shadow",
    "> /etc/sudoers",
    // privilege escalation shells
    " sudo su ",
    " sudo su -",
    " su root",
    " sudo -i ",
    " sudo -s ",
    " sudo bash ",
    " sudo sh ",
    // audit trail erasure
    " history -c",
    " unset histfile",
    "> /var/log/",
    " rm -rf /var/log",
    " journalctl --vacuum",
    // firewall flushing
    " iptables -f",
    " iptables --flush",
    " iptables -x",
    " nft flush ruleset",
    " ufw disable",
    " ufw --force disable",
    // power state
    " reboot ",
    " shutdown ",
    " halt ",
    " poweroff ",
    " init 0 ",
    " init 6 ",
    " systemctl reboot",
    " systemctl poweroff",
    // mounts and permissions on the root
    " umount / ",
    " chmod -r 777 / ",
    " chown -r ",
    // fork bomb
    ":(){",
];

/// Characters and sequences that chain or substitute commands.
const INJECTION_PATTERNS: &[&str] = &[";", "`", "$(", "${"];

/// Programs that take over the terminal and never return in a batch session.
const INTERACTIVE_PROGRAMS: &[&str] = &[
    "vi", "vim", "nvim", "nano", "emacs", "pico", "less", "more", "most", "top", "htop", "atop",
    "mc", "passwd", "su", "visudo", "vipw", "crontab -e",
];

/// Validates `command`, returning the rejection reason on failure.
pub fn validate_command(command: &str) -> Result<(), String> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err("empty command".to_string());
    }

    let padded = format!(" {} ", trimmed.to_lowercase());
    if let Some(pattern) = DENYLIST.iter().find(|pattern| padded.contains(*pattern)) {
        return Err(format!(
            "command matches a destructive pattern '{}'",
            pattern.trim()
        ));
    }

    if let Some(pattern) = INJECTION_PATTERNS.iter().find(|p| trimmed.contains(*p)) {
        return Err(format!(
            "command contains the shell metacharacter '{pattern}' (command chaining or substitution is not allowed)"
        ));
    }

    for segment in split_chain(trimmed) {
        let segment = segment.trim();
        if segment.is_empty() {
            return Err("command chain contains an empty segment".to_string());
        }
        if let Some(program) = interactive_program(segment) {
            return Err(format!(
                "'{program}' is an interactive program and would hang the session; use a non-interactive alternative"
            ));
        }
    }

    Ok(())
}

/// Splits a command on `&&` and `||` operators. A single `|` is a pipe and
/// stays inside its segment.
fn split_chain(command: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    let bytes = command.as_bytes();
    let mut idx = 0;
    while idx + 1 < bytes.len() {
        let pair = &bytes[idx..idx + 2];
        if pair == b"&&" || pair == b"||" {
            segments.push(&command[start..idx]);
            idx += 2;
            start = idx;
        } else {
            idx += 1;
        }
    }
    segments.push(&command[start..]);
    segments
}

fn interactive_program(segment: &str) -> Option<&'static str> {
    let mut tokens = segment.split_whitespace();
    let mut first = tokens.next()?;
    // `sudo vim` is as interactive as `vim`
    if first == "sudo" {
        match tokens.next() {
            Some(next) if next == "-i" || next == "-s" => return Some("sudo"),
            Some(next) => first = next,
            None => return None,
        }
    }
    let program = first.rsplit('/').next().unwrap_or(first);
    let second = tokens.next().unwrap_or_default();

    INTERACTIVE_PROGRAMS.iter().copied().find(|candidate| {
        match candidate.split_once(' ') {
            Some((name, flag)) => program == name && second == flag,
            None => program == *candidate,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(command: &str) -> String {
        validate_command(command).expect_err(&format!("'{command}' should be rejected"))
    }

    #[test]
    fn accepts_everyday_commands() {
        for command in [
            "ls -la /tmp",
            "cat /etc/os-release",
            "grep -r TODO src | head -n 20",
            "echo hello > /tmp/out.txt",
            "apt-get install -y nginx && systemctl status nginx",
            "rm -rf /tmp/build",
            "test -f /etc/hosts || echo missing",
            "df -h 2>&1",
        ] {
            assert_eq!(validate_command(command), Ok(()), "{command}");
        }
    }

    #[test]
    fn rejects_destructive_patterns() {
        for command in [
            "rm -rf /",
            "sudo rm -rf /",
            "rm -rf /*",
            "dd if=/dev/zero of=/dev/sda bs=1M",
            "mkfs.ext4 /dev/sdb1",
            "iptables -F",
            "sudo reboot",
            "shutdown -h now",
            "history -c",
            "find / -delete",
        ] {
            let reason = rejected(command);
            assert!(reason.contains("destructive"), "{command}: {reason}");
        }
    }

    #[test]
    fn word_boundaries_avoid_false_positives() {
        assert_eq!(validate_command("echo asphalt road"), Ok(()));
        assert_eq!(validate_command("ls /var/lib/reboot-required.d"), Ok(()));
    }

    #[test]
    fn rejects_injection_metacharacters() {
        for command in ["ls; rm x", "echo `id`", "echo $(whoami)", "echo ${HOME}"] {
            let reason = rejected(command);
            assert!(reason.contains("metacharacter"), "{command}: {reason}");
        }
    }

    #[test]
    fn rejects_interactive_programs_in_any_chain_segment() {
        assert!(rejected("vim /etc/hosts").contains("'vim'"));
        assert!(rejected("/usr/bin/nano notes.txt").contains("'nano'"));
        assert!(rejected("cd /etc && sudo vi hosts").contains("'vi'"));
        assert!(rejected("true || top").contains("'top'"));
        assert!(rejected("crontab -e").contains("crontab -e"));
        assert_eq!(validate_command("crontab -l"), Ok(()));
        assert_eq!(validate_command("less_filter --help"), Ok(()));
    }

    #[test]
    fn rejects_empty_commands_and_segments() {
        assert!(rejected("   ").contains("empty command"));
        assert!(rejected("ls &&").contains("empty segment"));
        assert!(rejected("&& ls").contains("empty segment"));
    }

    #[test]
    fn pipes_are_not_chain_operators() {
        assert_eq!(split_chain("a | b && c || d"), vec!["a | b ", " c ", " d"]);
    }
}
