use std::time::Duration;

use anyhow::Result;
use remote::{ChannelError, Connector, LocalConnector, ReadEvent, StreamLine};

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn exec_separates_streams_and_reports_status() -> Result<()> {
    let mut channel = LocalConnector::default().open().await?;
    let output = channel.exec("echo hello; echo world", TIMEOUT).await?;
    assert!(output.success());
    assert_eq!(output.stdout, ["hello", "world"]);
    assert!(output.stderr.is_empty());

    let output = channel.exec("echo oops >&2; false", TIMEOUT).await?;
    assert_eq!(output.status, 1);
    assert!(output.stdout.is_empty());
    assert_eq!(output.stderr, ["oops"]);
    channel.close().await;
    Ok(())
}

#[tokio::test]
async fn commands_share_one_shell() -> Result<()> {
    let mut channel = LocalConnector::default().open().await?;
    channel.exec("RDEPLOY_TEST_VALUE=42", TIMEOUT).await?;
    let output = channel
        .exec("printf '%s\\n' \"$RDEPLOY_TEST_VALUE\"", TIMEOUT)
        .await?;
    assert_eq!(output.stdout_text(), "42");
    channel.close().await;
    Ok(())
}

#[tokio::test]
async fn send_single_line_stops_at_first_line() -> Result<()> {
    let mut channel = LocalConnector::default().open().await?;
    let response = channel.send("echo one; echo two", true, TIMEOUT).await?;
    assert!(response.complete);
    assert_eq!(response.stdout, "one\n");
    assert_eq!(response.bytes, 4);
    // the rest is still there for the next read
    assert_eq!(
        channel.next_line(TIMEOUT).await?,
        ReadEvent::Line(StreamLine::Stdout("two".to_string()))
    );
    channel.close().await;
    Ok(())
}

#[tokio::test]
async fn send_returns_partial_result_on_timeout() -> Result<()> {
    let mut channel = LocalConnector::default().open().await?;
    let response = channel
        .send("echo err >&2", true, Duration::from_millis(300))
        .await?;
    assert!(!response.complete);
    assert_eq!(response.stdout, "");
    assert_eq!(response.stderr, "err\n");

    let response = channel
        .send("echo a; echo b", false, Duration::from_millis(300))
        .await?;
    assert!(response.complete);
    assert_eq!(response.stdout, "a\nb\n");
    channel.close().await;
    Ok(())
}

#[tokio::test]
async fn next_line_times_out_when_idle() -> Result<()> {
    let mut channel = LocalConnector::default().open().await?;
    assert_eq!(
        channel.next_line(Duration::from_millis(100)).await?,
        ReadEvent::TimedOut
    );
    channel.close().await;
    Ok(())
}

#[tokio::test]
async fn missing_ready_token_fails_open() -> Result<()> {
    // consumes the probe without ever answering it
    let connector = LocalConnector::default()
        .script("cat > /dev/null")
        .ready_timeout(Duration::from_millis(200));
    match connector.open().await {
        Err(ChannelError::NotReady { host, .. }) => assert_eq!(host, "localhost"),
        other => panic!("expected NotReady, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn close_is_idempotent_and_final() -> Result<()> {
    let mut channel = LocalConnector::default().open().await?;
    channel.close().await;
    channel.close().await;
    assert!(!channel.is_ready());
    assert!(matches!(
        channel.exec("true", TIMEOUT).await,
        Err(ChannelError::Closed { .. })
    ));
    assert_eq!(channel.next_line(TIMEOUT).await?, ReadEvent::Closed);
    Ok(())
}

#[tokio::test]
async fn multiline_commands_are_rejected() -> Result<()> {
    let mut channel = LocalConnector::default().open().await?;
    assert!(matches!(
        channel.write_command("echo a\necho b").await,
        Err(ChannelError::Io(_))
    ));
    channel.close().await;
    Ok(())
}
