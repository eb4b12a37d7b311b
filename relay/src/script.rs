//! Standalone bash agent for hosts without the `relay` binary.
//!
//! The rendered script speaks the same protocol as `relay agent`: it takes the
//! same lock name under `${TMPDIR:-/tmp}`, starts from the current version,
//! runs the last line of each new version, redacts long token-like runs, and
//! commits with one compare-and-swap retry. It needs `bash`, `curl`, `flock`,
//! `base64` and `sed`.

use crate::agent::AGENT_COMMIT_MESSAGE;
use crate::core::framing::{OUTPUT_HEADER, REDACT_MIN_RUN, REDACTED};
use crate::core::lock_name::lock_name;
use crate::core::types::Location;

/// Values baked into the script.
#[derive(Debug, Clone)]
pub struct ScriptParams {
    pub location: Location,
    pub token: String,
    pub interval_ms: u64,
    pub api_base: String,
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// `value` as a JSON string literal.
fn json_string(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}

/// `sleep` argument for an interval in milliseconds.
fn sleep_arg(interval_ms: u64) -> String {
    format!("{}.{:03}", interval_ms / 1_000, interval_ms % 1_000)
}

pub fn render_agent_script(params: &ScriptParams) -> String {
    let location = &params.location;
    let api_base = params.api_base.trim_end_matches('/');
    let mut out = String::new();
    out.push_str("#!/usr/bin/env bash\n");
    out.push_str(&format!("# relay agent for {location}\n"));
    out.push_str("set -u\n\n");
    out.push_str(&format!("TOKEN={}\n", shell_quote(&params.token)));
    out.push_str(&format!("BRANCH={}\n", shell_quote(&location.branch)));
    out.push_str(&format!(
        "API_URL={}\n",
        shell_quote(&format!(
            "{api_base}/repos/{}/{}/contents/{}",
            location.owner, location.repo, location.path
        ))
    ));
    out.push_str(&format!("SLEEP_SECS={}\n", sleep_arg(params.interval_ms)));
    out.push_str(&format!(
        "LOCK_FILE=\"${{TMPDIR:-/tmp}}/{}\"\n",
        lock_name(location)
    ));
    out.push_str(&format!(
        "BRANCH_JSON={}\n",
        shell_quote(&json_string(&location.branch))
    ));
    out.push_str(&format!(
        "MESSAGE_JSON={}\n",
        shell_quote(&json_string(AGENT_COMMIT_MESSAGE))
    ));
    out.push_str(&format!("OUTPUT_HEADER={}\n", shell_quote(OUTPUT_HEADER)));
    out.push_str(&format!(
        "REDACT_PATTERN={}\n",
        shell_quote(&format!("[A-Za-z0-9_-]{{{REDACT_MIN_RUN},}}"))
    ));
    out.push_str(&format!("REDACTED={}\n", shell_quote(REDACTED)));
    out.push_str(SCRIPT_BODY);
    out
}

const SCRIPT_BODY: &str = r#"
exec 9>"$LOCK_FILE" || exit 1
if ! flock -n 9; then
  exit 0
fi
trap 'rm -f "$LOCK_FILE"' EXIT
trap 'exit 0' INT TERM HUP
printf '%s\n' "$$" >&9

api() {
  curl -sS --max-time 10 \
    -H "Authorization: token ${TOKEN}" \
    -H "User-Agent: relay-agent" \
    "$@"
}

# First "sha" field of a JSON document.
json_sha() {
  tr ',{}' '\n\n\n' | sed -n 's/^[[:space:]]*"sha"[[:space:]]*:[[:space:]]*"\([0-9a-f]\{40\}\)".*/\1/p' | head -n 1
}

get_sha() {
  api -H "Accept: application/vnd.github.v3+json" "${API_URL}?ref=${BRANCH}" | json_sha
}

get_raw() {
  api -f -H "Accept: application/vnd.github.v3.raw" "${API_URL}?ref=${BRANCH}"
}

# put_update BODY EXPECTED_SHA: prints the new sha.
# Returns 1 when EXPECTED_SHA is stale, 2 on any other failure.
put_update() {
  local encoded response code
  encoded=$(printf '%s' "$1" | base64 | tr -d '\n')
  response=$(printf '{"message":%s,"content":"%s","sha":"%s","branch":%s}' \
      "$MESSAGE_JSON" "$encoded" "$2" "$BRANCH_JSON" \
    | api -X PUT -H "Content-Type: application/json" --data-binary @- \
      -w '\n%{http_code}' "$API_URL") || return 2
  code=${response##*$'\n'}
  response=${response%$'\n'*}
  case "$code" in
    200|201) printf '%s' "$response" | json_sha ;;
    409|422) return 1 ;;
    *) return 2 ;;
  esac
}

# Rejected credentials or a missing file end the agent; anything else is retried.
last_sha=""
while [ -z "$last_sha" ]; do
  response=$(api -H "Accept: application/vnd.github.v3+json" -w '\n%{http_code}' \
    "${API_URL}?ref=${BRANCH}") || response=$'\n000'
  code=${response##*$'\n'}
  response=${response%$'\n'*}
  case "$code" in
    200) last_sha=$(printf '%s' "$response" | json_sha) ;;
    401|404)
      printf 'relay agent: %s answered HTTP %s\n' "$API_URL" "$code" >&2
      exit 1
      ;;
    403)
      case "$response" in
        *"rate limit"*) ;;
        *)
          printf 'relay agent: %s answered HTTP %s\n' "$API_URL" "$code" >&2
          exit 1
          ;;
      esac
      ;;
  esac
  [ -n "$last_sha" ] || sleep "$SLEEP_SECS"
done

while :; do
  sleep "$SLEEP_SECS"
  sha=$(get_sha)
  if [ -z "$sha" ] || [ "$sha" = "$last_sha" ]; then
    continue
  fi
  content=$(get_raw) || continue
  directive=$(printf '%s\n' "$content" | tail -n 1)
  if [ -z "${directive//[[:space:]]/}" ]; then
    last_sha="$sha"
    continue
  fi
  history=$(printf '%s\n' "$content" | sed '$d')
  output=$( (eval "$directive") 2>&1 < /dev/null | sed -E "s/${REDACT_PATTERN}/${REDACTED}/g")
  body=$(printf '%s\n\n%s\n%s\n%s' "$history" "$OUTPUT_HEADER" "$output" "$directive")

  new_sha=""
  if new_sha=$(put_update "$body" "$sha"); then
    :
  elif [ $? -eq 1 ]; then
    # Rebuild on top of the winning version unless it replaced the directive.
    fresh=$(get_sha)
    fresh_content=$(get_raw) || fresh_content=""
    fresh_directive=$(printf '%s\n' "$fresh_content" | tail -n 1)
    fresh_history=$(printf '%s\n' "$fresh_content" | sed '$d')
    if [ -n "$fresh" ] && [ "$fresh_directive" = "$directive" ] \
        && [[ "$fresh_history" == "$history"* ]]; then
      body=$(printf '%s\n\n%s\n%s\n%s' "$fresh_history" "$OUTPUT_HEADER" "$output" "$directive")
      new_sha=$(put_update "$body" "$fresh") || new_sha=""
    elif [ -n "$fresh" ] && [ -n "$fresh_content" ]; then
      # last_sha is unchanged, so the new directive runs next.
      continue
    fi
  fi
  if [ -z "$new_sha" ]; then
    new_sha=$(get_sha)
  fi
  last_sha="${new_sha:-$sha}"
done
"#;
