use anyhow::Result;
use teloxide::prelude::*;
use tracing::info;

use crate::config::{messages, CONFIG};
use crate::handlers::responses::{reply_markdown, reply_text};
use crate::state::AppState;
use crate::store::UsageStats;
use crate::utils::markdown::escape_markdown_v2;
use crate::utils::telegram::user_key;
use crate::utils::timing::{complete_command_timer, start_command_timer};

fn mono(text: &str) -> String {
    format!("`{}`", text.replace('\\', "\\\\").replace('`', "\\`"))
}

fn help_section(command: &str, title: &str, body: &str) -> String {
    format!(
        "{} {}\n```\n{}\n```\n\n",
        mono(command),
        escape_markdown_v2(title),
        body.replace('\\', "\\\\").replace('`', "\\`")
    )
}

pub fn welcome_text(first_name: &str) -> String {
    format!(
        "سلام {}\nبه ایجنت *ASP* خوش اومدی\\.\n{}",
        escape_markdown_v2(first_name),
        escape_markdown_v2(messages::WELCOME)
    )
}

pub fn help_text() -> String {
    let mut text = format!("*{}*\n\n", escape_markdown_v2("راهنمای جامع استفاده از بات"));
    text.push_str(&help_section(
        "/img",
        "(تولید تصویر)",
        "دستور /img را بنویسید و متن خودتون رو جلوی دستور برای ساخت عکس بنویسید.\nاین عملیات ممکنه کمی زمانبر باشه.",
    ));
    text.push_str(&help_section(
        "/edit",
        "(ویرایش تصویر با ریپلای)",
        "روی یک عکس ریپلای بزنید (یا عکس را با کپشن بفرستید) و بعد از /edit ویرایشی که میخواین روی عکس اعمال بشه رو تایپ کنید.",
    ));
    text.push_str(&help_section(
        "/switch",
        "(تغییر مدل متن در چت خصوصی)",
        "با استفاده از این دستور میتونین مدل پردازش متن رو عوض کنید.",
    ));
    text.push_str(&help_section(
        "/clear",
        "(پاک کردن تاریخچه)",
        "تاریخچه گفتگوی شما با ربات پاک میشه و گفتگو از نو شروع میشه.",
    ));
    text.push_str(&help_section(
        "/info",
        "(آمار استفاده)",
        "تعداد پیام‌ها و تصاویر ساخته یا ویرایش شده امروز را نشان می‌دهد.",
    ));
    text.push_str(&escape_markdown_v2("استفاده در گروه (متن)"));
    text.push_str("\n```\nدر گروه ها، برای اینکه ربات به پیام متنی شما پاسخ دهد، پیام خود را با . شروع کنید. مثال: .سلام خوبی؟\n```\n\n");
    text.push_str(&escape_markdown_v2("استفاده در گروه (عکس)"));
    text.push_str("\n```\nدر گروه ها، برای پردازش یک عکس، کپشن عکس را با . شروع کنید. مثال: .این عکس چیست؟\n```");
    text
}

pub fn info_text(stats: &UsageStats) -> String {
    let line = |icon: &str, label: &str, value: u64| {
        format!("{icon} *{}* {value}\n", escape_markdown_v2(label))
    };
    let mut text = format!("📊 *{}* 📊\n\n", escape_markdown_v2("آمار استفاده شما"));
    text.push_str(&line("💬", "کل پیام‌ها:", stats.messages));
    text.push_str(&line("🎨", "تصاویر ساخته شده امروز:", stats.generated_images));
    text.push_str(&line("🖼️", "تصاویر ویرایش شده امروز:", stats.edited_images));
    text.push_str(&line("🎤", "پیام‌های صوتی امروز:", stats.voices));
    text.push_str(&line("📄", "فایل‌های ارسال شده:", stats.files));
    text.push_str(&format!(
        "\n_{}_",
        escape_markdown_v2("آمار روزانه هر شب ساعت ۰۰:۰۰ ریست می‌شود.")
    ));
    text
}

pub async fn start_handler(bot: Bot, message: Message) -> Result<()> {
    let first_name = message
        .from
        .as_ref()
        .map(|user| user.first_name.clone())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| messages::FALLBACK_NAME.to_string());
    reply_markdown(&bot, &message, &welcome_text(&first_name)).await?;
    Ok(())
}

pub async fn help_handler(bot: Bot, message: Message) -> Result<()> {
    reply_markdown(&bot, &message, &help_text()).await?;
    Ok(())
}

pub async fn info_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user_id) = user_key(&message) else {
        return Ok(());
    };
    let stats = state.store.stats(&user_id);
    reply_markdown(&bot, &message, &info_text(&stats)).await?;
    Ok(())
}

pub async fn clear_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user_id) = user_key(&message) else {
        return Ok(());
    };
    let mut timer = start_command_timer("clear", &message);

    // Waits for an in-flight answer so it cannot land after the wipe.
    let lock = state.user_lock(&user_id);
    let cleared = {
        let _turn = lock.lock().await;
        state.store.clear(&user_id)
    };
    state.reset_preference(&user_id);

    if cleared {
        info!(user_id = %user_id, "History cleared");
        state.store.persist_in_background();
        reply_text(&bot, &message, messages::HISTORY_CLEARED).await?;
    } else {
        reply_text(&bot, &message, messages::NOTHING_TO_CLEAR).await?;
    }
    complete_command_timer(&mut timer, "success", Some(format!("cleared={cleared}")));
    Ok(())
}

pub async fn switch_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if !message.chat.is_private() {
        reply_text(&bot, &message, messages::SWITCH_ONLY_PRIVATE).await?;
        return Ok(());
    }
    let Some(user_id) = user_key(&message) else {
        return Ok(());
    };

    let preference = state.toggle_preference(&user_id);
    let model = CONFIG.model_for(preference);
    info!(user_id = %user_id, model = model, "Model switched");
    reply_text(
        &bot,
        &message,
        &messages::SWITCHED_MODEL.replace("{}", model),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welcome_text_escapes_the_name() {
        let text = welcome_text("a_b.");
        assert!(text.starts_with("سلام a\\_b\\.\n"));
        assert!(text.contains("*ASP*"));
    }

    #[test]
    fn help_text_lists_every_command() {
        let text = help_text();
        for command in ["/img", "/edit", "/switch", "/clear", "/info"] {
            assert!(text.contains(&format!("`{command}`")), "{command} missing");
        }
        assert_eq!(text.matches("```").count() % 2, 0);
    }

    #[test]
    fn info_text_shows_all_counters() {
        let stats = UsageStats {
            messages: 12,
            generated_images: 3,
            edited_images: 1,
            voices: 2,
            files: 5,
        };
        let text = info_text(&stats);
        for value in ["12", "3", "1", "2", "5"] {
            assert!(text.contains(&format!("* {value}\n")));
        }
        assert!(text.ends_with('_'));
    }
}
