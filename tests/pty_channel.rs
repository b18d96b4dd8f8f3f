#[cfg(unix)]
mod pty_channel {
    use std::error::Error;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use taskmux::pty::{
        spawn, ExitOutcome, ExitWaiter, ProcessHandle, PtyChannel, PtyError, PtyReader, SpawnSpec,
        TerminalSize,
    };

    fn drain(mut reader: PtyReader) -> Vec<u8> {
        let mut output = Vec::new();
        let mut buffer = [0u8; 1024];
        while let Ok(count) = reader.read_chunk(&mut buffer) {
            if count == 0 {
                break;
            }
            output.extend_from_slice(&buffer[..count]);
        }
        output
    }

    fn run_and_capture(spec: &SpawnSpec) -> Result<(Vec<u8>, ExitOutcome), Box<dyn Error>> {
        let (channel, slave) = PtyChannel::open(TerminalSize::default())?;
        let reader = channel.take_reader()?;
        let (_process, waiter) = spawn(spec, slave)?;
        let output = drain(reader);
        let outcome = waiter.wait();
        channel.close();
        Ok((output, outcome))
    }

    struct Session {
        channel: PtyChannel,
        output: Arc<Mutex<Vec<u8>>>,
        reader_handle: thread::JoinHandle<()>,
    }

    impl Session {
        fn spawn(
            spec: &SpawnSpec,
            size: TerminalSize,
        ) -> Result<(Self, ProcessHandle, ExitWaiter), Box<dyn Error>> {
            let (channel, slave) = PtyChannel::open(size)?;
            let reader = channel.take_reader()?;
            let (process, waiter) = spawn(spec, slave)?;

            let output = Arc::new(Mutex::new(Vec::new()));
            let output_clone = Arc::clone(&output);
            let reader_handle = thread::spawn(move || {
                let mut reader = reader;
                let mut buffer = [0u8; 1024];
                loop {
                    match reader.read_chunk(&mut buffer) {
                        Ok(0) | Err(_) => break,
                        Ok(count) => {
                            if let Ok(mut output) = output_clone.lock() {
                                output.extend_from_slice(&buffer[..count]);
                            }
                        }
                    }
                }
            });
            Ok((
                Self {
                    channel,
                    output,
                    reader_handle,
                },
                process,
                waiter,
            ))
        }

        fn wait_for_output(&self, needle: &str, timeout: Duration) -> bool {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if let Ok(output) = self.output.lock() {
                    if String::from_utf8_lossy(&output).contains(needle) {
                        return true;
                    }
                }
                thread::sleep(Duration::from_millis(20));
            }
            false
        }

        fn finish(self) -> String {
            let _ = self.reader_handle.join();
            self.channel.close();
            let output = self.output.lock().unwrap();
            String::from_utf8_lossy(&output).into_owned()
        }
    }

    #[test]
    fn spawn_runs_through_the_shell_and_captures_output() -> Result<(), Box<dyn Error>> {
        let (output, outcome) = run_and_capture(&SpawnSpec::new("printf 'ready'"))?;
        assert!(String::from_utf8_lossy(&output).contains("ready"));
        assert_eq!(outcome, ExitOutcome::Exited(0));
        Ok(())
    }

    #[test]
    fn exit_code_is_reported() -> Result<(), Box<dyn Error>> {
        let (_, outcome) = run_and_capture(&SpawnSpec::new("exit 7"))?;
        assert_eq!(outcome, ExitOutcome::Exited(7));
        assert!(!outcome.success());
        Ok(())
    }

    #[test]
    fn working_dir_and_term_are_applied() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let mut spec = SpawnSpec::new("pwd; printf \"$TERM\"");
        spec.working_dir = Some(dir.path().to_path_buf());
        let (output, _) = run_and_capture(&spec)?;
        let text = String::from_utf8_lossy(&output);
        let name = dir.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(text.contains(&name), "output: {:?}", text);
        assert!(text.contains("xterm-256color"));
        Ok(())
    }

    #[test]
    fn input_reaches_the_child() -> Result<(), Box<dyn Error>> {
        let spec = SpawnSpec::new("read line; printf \"got:$line\"");
        let (session, process, waiter) = Session::spawn(&spec, TerminalSize::default())?;
        session.channel.write(b"ping\n")?;
        assert!(session.wait_for_output("got:ping", Duration::from_secs(2)));

        let outcome = waiter.wait();
        assert!(process.has_exited());
        assert!(outcome.success());
        assert!(session.finish().contains("got:ping"));
        Ok(())
    }

    #[test]
    fn resize_updates_child_terminal_size() -> Result<(), Box<dyn Error>> {
        let spec = SpawnSpec::new("stty size; read x; stty size");
        let (session, _process, waiter) = Session::spawn(&spec, TerminalSize::new(24, 80))?;
        assert!(session.wait_for_output("24 80", Duration::from_secs(2)));
        assert_eq!(session.channel.size()?, TerminalSize::new(24, 80));

        session.channel.resize(TerminalSize::new(40, 100))?;
        assert_eq!(session.channel.size()?, TerminalSize::new(40, 100));
        session.channel.write(b"\n")?;

        assert!(waiter.wait().success());
        let text = session.finish();
        assert!(text.contains("24 80"), "output: {:?}", text);
        assert!(text.contains("40 100"), "output: {:?}", text);
        Ok(())
    }

    #[test]
    fn terminate_signals_the_process_group() -> Result<(), Box<dyn Error>> {
        let spec = SpawnSpec::new("sleep 30 & wait");
        let (session, process, waiter) = Session::spawn(&spec, TerminalSize::default())?;
        assert!(process.pid().is_some());
        process.terminate()?;
        let outcome = waiter.wait();
        assert!(!outcome.success(), "outcome: {}", outcome);
        assert!(process.has_exited());
        // Signalling after the reap is a no-op.
        process.kill()?;
        session.finish();
        Ok(())
    }

    #[test]
    fn unknown_program_exits_with_shell_error() -> Result<(), Box<dyn Error>> {
        let (output, outcome) = run_and_capture(&SpawnSpec::new("definitely-not-a-real-program-xyz"))?;
        assert_eq!(outcome, ExitOutcome::Exited(127));
        assert!(!output.is_empty());
        Ok(())
    }

    #[test]
    fn writes_after_close_fail() -> Result<(), Box<dyn Error>> {
        let (channel, _slave) = PtyChannel::open(TerminalSize::default())?;
        channel.close();
        assert!(matches!(channel.write(b"x"), Err(PtyError::Closed)));
        assert!(matches!(
            channel.resize(TerminalSize::new(10, 10)),
            Err(PtyError::Closed)
        ));
        Ok(())
    }
}
