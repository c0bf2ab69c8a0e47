use super::*;

/// Prompt used when the session args do not carry one.
const DEFAULT_PROMPT: &str = r"[>#$%\]]\s*$";

/// Interactive shell over SSH.
///
/// The session owns a small tokio runtime and blocks on it, so it can be used
/// from plain threads. Shell I/O runs in a background task that forwards
/// output chunks through a channel.
pub struct SshSession {
    runtime: Runtime,
    client: Client,
    sender: Sender<String>,
    recv: Receiver<String>,
    args: SessionArgs,
    security: ConnectionSecurityOptions,
    command_timeout: Duration,
    prompt: String,
}

struct Shell {
    client: Client,
    sender: Sender<String>,
    recv: Receiver<String>,
}

impl SshSession {
    /// Connects, opens a shell and waits for the first prompt.
    ///
    /// Reads `host`, `port` (default 22) and `user` attributes and the
    /// `password` secret from `args`.
    pub fn connect(
        args: &SessionArgs,
        security: ConnectionSecurityOptions,
        command_timeout: Duration,
    ) -> Result<Self, CliError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;
        let shell = runtime.block_on(open_shell(args, &security))?;

        let mut session = Self {
            runtime,
            client: shell.client,
            sender: shell.sender,
            recv: shell.recv,
            args: args.clone(),
            security,
            command_timeout,
            prompt: String::new(),
        };
        let prompt = session.ready_prompt().to_string();
        session.wait_for_prompt(&prompt, command_timeout)?;
        Ok(session)
    }

    /// The last prompt line seen on this shell.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    fn ready_prompt(&self) -> &str {
        if self.args.prompt.is_empty() {
            DEFAULT_PROMPT
        } else {
            &self.args.prompt
        }
    }

    fn wait_for_prompt(&mut self, prompt: &str, timeout: Duration) -> Result<String, CliError> {
        let mut state = ExpectState::new(prompt, None, None)?;
        self.wait(&mut state, timeout)
    }

    fn wait(&mut self, state: &mut ExpectState<'_>, timeout: Duration) -> Result<String, CliError> {
        let deadline = config::deadline_after(timeout);
        let recv = &mut self.recv;
        let sender = &self.sender;
        let output = self.runtime.block_on(async {
            loop {
                let received = match deadline {
                    Some(deadline) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        tokio::time::timeout(remaining, recv.recv()).await
                    }
                    None => Ok(recv.recv().await),
                };
                match received {
                    Err(_) => return Err(CliError::ExpectTimeout(state.output().to_string())),
                    Ok(None) => return Err(CliError::ChannelDisconnect),
                    Ok(Some(data)) => {
                        trace!("{:?}", data);
                        match state.feed(&data)? {
                            ExpectStep::Pending => {}
                            ExpectStep::Reply(reply) => sender.send(reply).await?,
                            ExpectStep::Done(output) => return Ok(output),
                        }
                    }
                }
            }
        })?;
        self.prompt = last_line(&output).to_string();
        Ok(output)
    }
}

impl Session for SshSession {
    fn send_and_expect(
        &mut self,
        command: &str,
        expected: &str,
        action_map: Option<&ActionMap>,
        error_map: Option<&ErrorMap>,
    ) -> Result<String, CliError> {
        if !self.is_valid() {
            return Err(CliError::ConnectClosed);
        }
        let mut state = ExpectState::new(expected, action_map, error_map)?;

        // Drop residual output from earlier commands.
        while self.recv.try_recv().is_ok() {}

        debug!("{} send {:?}", self.args.label(), command);
        let full_command = format!("{command}\n");
        self.runtime.block_on(self.sender.send(full_command))?;
        let timeout = self.command_timeout;
        self.wait(&mut state, timeout)
    }

    fn is_valid(&self) -> bool {
        !self.client.is_closed()
    }

    fn args(&self) -> &SessionArgs {
        &self.args
    }

    fn reconnect(&mut self, prompt: &str, timeout: Option<Duration>) -> Result<(), CliError> {
        debug!("{} reconnecting", self.args.label());
        self.recv.close();
        let shell = self.runtime.block_on(open_shell(&self.args, &self.security))?;
        self.client = shell.client;
        self.sender = shell.sender;
        self.recv = shell.recv;
        self.wait_for_prompt(prompt, timeout.unwrap_or(self.command_timeout))?;
        debug!("{} reconnected at prompt {:?}", self.args.label(), self.prompt);
        Ok(())
    }

    fn close(&mut self) {
        debug!("Safely closing SSH connection {}", self.args.label());
        self.recv.close();
        if self.is_valid() {
            let sender = &self.sender;
            self.runtime.block_on(async {
                if let Err(e) = sender.send("exit\n".to_string()).await {
                    debug!("Failed to send exit command: {:?}", e);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            });
        }
    }
}

async fn open_shell(
    args: &SessionArgs,
    security: &ConnectionSecurityOptions,
) -> Result<Shell, CliError> {
    let addr = args.require("host")?.to_string();
    let user = args.require("user")?.to_string();
    let port = match args.get("port") {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| CliError::InvalidConfig(format!("invalid port '{port}'")))?,
        None => 22,
    };
    let password = args
        .get_secret("password")
        .ok_or_else(|| CliError::MissingAttribute("password".to_string()))?;
    let device_addr = format!("{user}@{addr}:{port}");

    let config = Config {
        preferred: security.preferred(),
        inactivity_timeout: Some(Duration::from_secs(60)),
        ..Default::default()
    };

    let client = Client::connect_with_config(
        (addr, port),
        &user,
        AuthMethod::with_password(password),
        security.server_check.clone(),
        config,
    )
    .await?;
    debug!("{} TCP connection successful", device_addr);

    let mut channel = client.get_channel().await?;
    channel
        .request_pty(false, "xterm", 800, 600, 0, 0, &[])
        .await?;
    channel.request_shell(false).await?;
    debug!("{} Shell request successful", device_addr);

    let (sender_to_shell, mut receiver_from_user) = mpsc::channel::<String>(256);
    let (sender_to_user, receiver_from_shell) = mpsc::channel::<String>(256);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(data) = receiver_from_user.recv() => {
                    if let Err(e) = channel.data(data.as_bytes()).await {
                        debug!("{} Failed to send data to shell: {:?}", device_addr, e);
                        break;
                    }
                },
                Some(msg) = channel.wait() => {
                    match msg {
                        ChannelMsg::Data { ref data } => {
                            let text = String::from_utf8_lossy(data).into_owned();
                            if sender_to_user.send(text).await.is_err() {
                                debug!("{} Shell output receiver dropped. Closing task.", device_addr);
                                break;
                            }
                        }
                        ChannelMsg::ExitStatus { exit_status } => {
                            debug!("{} Shell exited with status code: {}", device_addr, exit_status);
                            let _ = channel.eof().await;
                            break;
                        }
                        ChannelMsg::Eof => {
                            debug!("{} Shell sent EOF.", device_addr);
                            break;
                        }
                        _ => {}
                    }
                }
                else => break,
            }
        }
        debug!("{} SSH I/O task ended.", device_addr);
    });

    Ok(Shell {
        client,
        sender: sender_to_shell,
        recv: receiver_from_shell,
    })
}

/// Creates [`SshSession`]s for a pool.
///
/// The security profile comes from the factory when set, otherwise from the
/// `security` session attribute, otherwise the secure default.
#[derive(Debug, Clone)]
pub struct SshSessionFactory {
    security: Option<ConnectionSecurityOptions>,
    command_timeout: Duration,
}

impl Default for SshSessionFactory {
    fn default() -> Self {
        Self {
            security: None,
            command_timeout: config::DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl SshSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_security(mut self, security: ConnectionSecurityOptions) -> Self {
        self.security = Some(security);
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn security_for(&self, args: &SessionArgs) -> Result<ConnectionSecurityOptions, CliError> {
        if let Some(security) = self.security.as_ref() {
            return Ok(security.clone());
        }
        match args.get("security") {
            Some(level) => Ok(ConnectionSecurityOptions::for_level(
                SecurityLevel::from_attr(level)?,
            )),
            None => Ok(ConnectionSecurityOptions::default()),
        }
    }
}

impl SessionFactory for SshSessionFactory {
    type Session = SshSession;

    fn new_session(&self, args: &SessionArgs) -> Result<SshSession, CliError> {
        let security = self.security_for(args)?;
        SshSession::connect(args, security, self.command_timeout)
    }
}
